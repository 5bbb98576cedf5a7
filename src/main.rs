use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use balancer_config::AppConfig;

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let matches = Command::new("comfy-balancer")
        .version("1.0.0")
        .about("ComfyUI 负载均衡器 - 多后端任务分发与队列管理")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径 (默认: config.yaml)"),
        )
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .value_name("HOST")
                .help("监听地址，覆盖配置文件"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("监听端口，覆盖配置文件"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("调试模式"),
        )
        .get_matches();

    let debug = matches.get_flag("debug");
    init_tracing(debug);

    // 加载配置；命令行参数覆盖配置文件
    let mut config = match AppConfig::load(matches.get_one::<String>("config").map(String::as_str))
    {
        Ok(config) => config,
        Err(e) => {
            error!("配置加载失败: {}", e);
            return 1;
        }
    };
    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }
    if debug {
        config.server.debug = true;
    }

    let application = match Application::new(config).await {
        Ok(application) => application,
        Err(e) => {
            error!("应用初始化失败: {}", e);
            return 1;
        }
    };

    let listener = match application.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "绑定监听地址失败 {}:{}: {}",
                application.config().server.host,
                application.config().server.port,
                e
            );
            return 2;
        }
    };

    let shutdown = Arc::new(ShutdownManager::new());

    // Ctrl-C 触发优雅关闭
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到中断信号");
                shutdown.shutdown();
            }
        });
    }

    match application.run(listener, shutdown).await {
        Ok(()) => 0,
        Err(e) => {
            error!("运行时错误: {}", e);
            1
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
