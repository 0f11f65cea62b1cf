//! devmasterctl: sends control datagrams to the running daemon's helper
//! socket (spec module K).
use clap::{Parser, Subcommand};
use devmaster::event::HELPER_MAGIC;
use nix::sys::socket::{sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};

#[derive(Parser, Debug)]
#[clap(name = "devmasterctl", about = "control client for devmasterd")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// stop the execution queue
    Stop,
    /// start (or resume) the execution queue
    Start,
    /// set the daemon's log priority
    SetLogLevel {
        level: u32,
    },
    /// set the maximum concurrent workers per devpath
    SetMaxChilds {
        n: u32,
    },
}

fn datagram(type_tag: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.extend_from_slice(&HELPER_MAGIC);
    buf.extend_from_slice(&type_tag.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn main() {
    let args = Args::parse();

    let buf = match args.command {
        Command::Stop => datagram(3, &[]),
        Command::Start => datagram(4, &[]),
        Command::SetLogLevel { level } => datagram(5, &level.to_le_bytes()),
        Command::SetMaxChilds { n } => datagram(6, &n.to_le_bytes()),
    };

    let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::empty(), None).unwrap_or_else(|e| {
        eprintln!("devmasterctl: failed to create socket: {e}");
        std::process::exit(1);
    });

    let addr = UnixAddr::new_abstract(b"devmasterd").unwrap_or_else(|e| {
        eprintln!("devmasterctl: bad abstract address: {e}");
        std::process::exit(1);
    });

    if let Err(e) = sendto(fd, &buf, &nix::sys::socket::SockAddr::Unix(addr), MsgFlags::empty()) {
        eprintln!("devmasterctl: failed to send control message: {e}");
        std::process::exit(1);
    }
}
