use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod build;
mod cache;
mod check;
mod compiler;
mod config;
mod taglib;
mod watch;

#[derive(Parser)]
#[command(name = "spyce", about = "Spyce 模板编译器", version = long_version())]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 编译模板：单个 .spy 文件，或整个模板目录
    Compile {
        /// 单个模板文件；缺省时编译模板目录下全部模板
        input: Option<PathBuf>,

        /// 单文件模式的输出路径（缺省打印到标准输出）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 忽略缓存强制重编
        #[arg(long)]
        force: bool,

        /// 项目根目录（默认当前目录）
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },

    /// 检查全部模板的可编译性
    Check {
        /// 项目根目录（默认当前目录）
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },

    /// 监听模板目录，变更后自动重新编译
    Watch {
        /// 项目根目录（默认当前目录）
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // None 等同于 Compile { input: None, root: "." }
    let command = cli.command.unwrap_or(Commands::Compile {
        input: None,
        output: None,
        force: false,
        root: PathBuf::from("."),
    });

    // 以配置中的日志级别作为默认值
    let default_level = match &command {
        Commands::Compile { root, .. }
        | Commands::Check { root, .. }
        | Commands::Watch { root, .. } => {
            config::SpyceConfig::load(&root.canonicalize().unwrap_or_else(|_| root.clone()))
                .ok()
                .map(|c| c.log.level)
        }
    };

    let default_level = default_level.as_deref().unwrap_or("info");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match command {
        Commands::Compile {
            input: Some(file),
            output,
            ..
        } => {
            let mut checker = taglib::BasicTagChecker::new();
            let result = compiler::compile_file(&file, &mut checker)?;
            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &result.code)?;
                    let map_path = path.with_extension("lines.json");
                    std::fs::write(&map_path, serde_json::to_string_pretty(&result.line_refs)?)?;
                    tracing::info!("已写出 {}", path.display());
                }
                None => print!("{}", result.code),
            }
        }
        Commands::Compile {
            input: None,
            force,
            root,
            ..
        } => {
            let root = root.canonicalize()?;
            let config = config::SpyceConfig::load(&root)?;
            let stats = build::run(&root, &config, force)?;
            if stats.failed > 0 {
                anyhow::bail!("{} 个模板编译失败", stats.failed);
            }
        }
        Commands::Check { root } => {
            let root = root.canonicalize()?;
            let result = check::run(&root)?;

            for w in &result.warnings {
                tracing::warn!("{w}");
            }
            for e in &result.errors {
                tracing::error!("{e}");
            }

            if result.errors.is_empty() {
                tracing::info!("检查通过（{} 个警告）", result.warnings.len());
            } else {
                anyhow::bail!(
                    "检查未通过：{} 个错误，{} 个警告",
                    result.errors.len(),
                    result.warnings.len()
                );
            }
        }
        Commands::Watch { root } => {
            let root = root.canonicalize()?;
            let config = config::SpyceConfig::load(&root)?;
            watch::run(&root, &config)?;
        }
    }

    Ok(())
}

const fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        "\ncommit:  ",
        env!("SPYCE_GIT_COMMIT"),
        "\nbuild:   ",
        env!("SPYCE_BUILD_TIME"),
        "\ntarget:  ",
        env!("SPYCE_BUILD_TARGET"),
        "\nprofile: ",
        env!("SPYCE_BUILD_PROFILE"),
    )
}
