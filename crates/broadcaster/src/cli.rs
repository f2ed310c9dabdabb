use std::path::PathBuf;

use anyhow::Context;

pub(crate) struct Args {
    pub config_path: PathBuf,
    pub hub_url: Option<String>,
    pub capture_source: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("./config/wall-broadcaster.toml");
    let mut hub_url = None;
    let mut capture_source = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("wall-broadcaster {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("wall-broadcaster - video-wall broadcaster media pipeline");
                println!();
                println!("USAGE:");
                println!("    wall-broadcaster [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config, -c <PATH>      Config file [default: ./config/wall-broadcaster.toml]");
                println!("    --hub-url <URL>          Override hub.url");
                println!("    --capture-source <NAME>  Override capture.source (screen, camera, test-pattern)");
                println!("    -V, --version            Print version and exit");
                println!("    -h, --help               Print this help and exit");
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--hub-url" => {
                i += 1;
                hub_url = Some(args.get(i).context("Missing --hub-url value")?.clone());
            }
            "--capture-source" => {
                i += 1;
                capture_source = Some(
                    args.get(i)
                        .context("Missing --capture-source value")?
                        .clone(),
                );
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        hub_url,
        capture_source,
    })
}
