use crate::build;
use crate::config::SpyceConfig;
use anyhow::Result;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

/// 监听模板目录，.spy 变更后自动重新编译
///
/// 初始先做一次全量构建；此后每簇文件事件触发一次增量构建，
/// 编译失败只记日志，监听继续。
pub fn run(project_root: &Path, config: &SpyceConfig) -> Result<()> {
    if let Err(e) = build::run(project_root, config, false) {
        tracing::error!("初始编译失败：{e}");
    }

    let source_dir = project_root.join(&config.compiler.source_dir);
    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(tx)?;
    watcher.watch(&source_dir, RecursiveMode::Recursive)?;
    tracing::info!("监听 {} 中，Ctrl-C 退出", source_dir.display());

    loop {
        let event = match rx.recv() {
            Ok(Ok(ev)) => ev,
            Ok(Err(e)) => {
                tracing::warn!("监听事件错误：{e}");
                continue;
            }
            Err(_) => break,
        };
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            continue;
        }
        if !event
            .paths
            .iter()
            .any(|p| p.extension().is_some_and(|e| e == "spy"))
        {
            continue;
        }

        // 保存时事件成簇出现，短暂等待后清空积压再重编一次
        std::thread::sleep(Duration::from_millis(100));
        while rx.try_recv().is_ok() {}

        if let Err(e) = build::run(project_root, config, false) {
            tracing::error!("重新编译失败：{e}");
        }
    }
    Ok(())
}
