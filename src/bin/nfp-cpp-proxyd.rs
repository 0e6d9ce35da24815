use clap::{App, Arg, ArgGroup};
use log::error;
use nfp_cpp_proxy::{
    error::ProxyError, shutdown_on_signals, Hardware, ProxyConfig, Result, Server,
    SimulatedDevice, SysfsDevice,
};
use nix::sys::signal::Signal;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("nfp-cpp-proxyd: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = App::new("nfp-cpp-proxyd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("CPP bus proxy: shares a SmartNIC's expansion windows over a Unix socket")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("socket")
                .short("s")
                .long("socket")
                .value_name("PATH")
                .help("Path of the listening socket")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max_connections")
                .short("m")
                .long("max-connections")
                .value_name("COUNT")
                .help("Maximum number of connected clients")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("BDF")
                .help("PCI address of the device, e.g. 0000:04:00.0")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Serve an in-memory simulated device"),
        )
        .group(
            ArgGroup::with_name("hardware")
                .args(&["device", "simulate"])
                .required(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(path) = matches.value_of("socket") {
        config = config.with_socket_path(path);
    }
    if let Some(count) = matches.value_of("max_connections") {
        let count: usize = count.parse().map_err(|_| {
            ProxyError::invalid_parameter("max-connections", "Invalid connection count")
        })?;
        config = config.with_max_connections(count);
    }

    let hardware: Box<dyn Hardware> = match matches.value_of("device") {
        Some(bdf) => Box::new(SysfsDevice::open(bdf)?),
        None => Box::new(SimulatedDevice::nfp6000()),
    };

    let mut server = Server::bind(config, hardware)?;
    // Dropping the server on the way out removes the socket file
    shutdown_on_signals(server.shutdown_handle(), &[Signal::SIGINT, Signal::SIGTERM])?;
    server.run()
}
