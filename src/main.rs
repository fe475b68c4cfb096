use clap::Parser;
use rtpmidi_rust::{
    common::{box_error::BoxError, config::Config},
    daemon::{Daemon, Settings},
    discovery::NullMdns,
    sequencer::LoopbackSequencer,
};

#[derive(Parser)]
#[command(version, about = "RTP MIDI bridging daemon", long_about = None)]
struct Args {
    /// port the import listener binds (data port is this plus one)
    #[arg(short, long)]
    port: Option<u16>,

    /// name announced on the network
    #[arg(short, long)]
    name: Option<String>,

    /// control socket path
    #[arg(short, long)]
    control: Option<String>,

    /// connect at startup: name, name:port, or name:host:port (repeatable)
    #[arg(long = "connect-to")]
    connect_to: Vec<String>,

    /// settings file
    #[arg(long, default_value = "rtpmidi_settings.json")]
    config: String,
}

fn main() -> Result<(), BoxError> {
    // Turn on the logger
    env_logger::init();

    let args = Args::parse();
    let mut config = Config::build(&args.config);
    config.load_from_file()?;

    let default_name =
        std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("rtpmidi"));
    let settings = Settings {
        name: args
            .name
            .unwrap_or_else(|| String::from(config.get_value("name", &default_name))),
        port: args.port.unwrap_or_else(|| config.get_u16_value("port", 5004)),
        control_path: args.control.unwrap_or_else(|| {
            String::from(config.get_value("control", "/var/run/rtpmidid.sock"))
        }),
        connect_to: if !args.connect_to.is_empty() {
            args.connect_to
        } else {
            config.get_list_value("connect_to")
        },
    };

    let mut daemon = Daemon::build(
        &settings,
        Box::new(LoopbackSequencer::build()),
        Box::new(NullMdns),
    )?;
    daemon.run()
}
