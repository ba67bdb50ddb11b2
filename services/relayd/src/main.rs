use clap::{App, Arg};
use std::process;
use std::time::Duration;
use webmrelay::logging;
use webmrelay::net::endpoint::Endpoint;

fn main() {
    let matches = App::new("relayd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relays live WebM streams from one publisher to many viewers.")
        .arg(
            Arg::with_name("ADDRESS")
                .help("Address to bind the HTTP listener to")
                .required(true),
        )
        .arg(
            Arg::with_name("PORT")
                .help("Port to listen on")
                .required(true),
        )
        .arg(
            Arg::with_name("stream-timeout")
                .long("stream-timeout")
                .value_name("SECONDS")
                .help("How long an idle stream is kept before it is deleted")
                .takes_value(true),
        )
        .get_matches();

    let address = matches.value_of("ADDRESS").unwrap();
    let port = matches.value_of("PORT").unwrap();
    let port: u16 = match port.parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid port: {}", port);
            process::exit(1);
        }
    };

    let timeout = matches.value_of("stream-timeout").unwrap_or("60");
    let timeout: u64 = match timeout.parse() {
        Ok(timeout) => timeout,
        Err(_) => {
            eprintln!("invalid stream timeout: {}", timeout);
            process::exit(1);
        }
    };

    let log = logging::init();

    let mut endpoint = match Endpoint::new(
        &format!("{}:{}", address, port),
        Duration::from_secs(timeout),
        log.new(logging::o!()),
    ) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            logging::crit!(log, "server setup failed"; "error" => %err);
            process::exit(1);
        }
    };

    if let Err(err) = endpoint.run() {
        logging::crit!(log, "server failed"; "error" => %err);
        process::exit(1);
    }

    logging::info!(log, "shut down cleanly");
}
