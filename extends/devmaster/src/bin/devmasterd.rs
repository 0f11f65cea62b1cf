//! devmasterd: the daemon entry point. Bootstraps sockets and the
//! self-pipe, then runs the single-threaded reactor until `SIGINT`/`SIGTERM`.
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use devmaster::config::DaemonConfig;
use devmaster::daemon::Daemon;

#[derive(Parser, Debug)]
#[clap(name = "devmasterd", about = "userspace device-node manager daemon")]
struct Args {
    /// optional TOML config file, layered under environment tunables
    #[clap(long)]
    config: Option<PathBuf>,

    /// log level: error, warn, info, debug, trace
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    libutils::logging::init(libutils::logging::level_from_str(&args.log_level));

    if !nix::unistd::getuid().is_root() {
        log::error!("devmasterd must run as root");
        std::process::exit(1);
    }

    let config = DaemonConfig::load(args.config.as_deref());

    let daemon = match Daemon::bootstrap(config) {
        Ok(d) => Rc::new(d),
        Err(e) => {
            log::error!("fatal setup error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run() {
        log::error!("daemon loop exited with error: {e}");
        std::process::exit(1);
    }
}
