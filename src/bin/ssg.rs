use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use slog::info;
use ssg::{
    api,
    client::{Client, ClientError},
    config,
    logging::{setup_logging, LogFormat, LoggingConfiguration},
    server::Server,
};
use std::{io, process, sync::Arc};
use tokio::runtime;

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_REMOTE: i32 = 2;
const EXIT_ENCODING: i32 = 3;

fn main() {
    process::exit(run());
}

fn url_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("url")
        .short("u")
        .long("url")
        .env("SSG_URL")
        .takes_value(true)
        .help("Base URL of the gateway, e.g. http://127.0.0.1:8080")
}

fn token_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("token")
        .short("t")
        .long("token")
        .env("SSG_TOKEN")
        .takes_value(true)
        .help("Control (or monitor) bearer token")
}

fn stream_token_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("stream-token")
        .long("stream-token")
        .env("SSG_STREAM_TOKEN")
        .takes_value(true)
        .help("Per-stream bearer token issued by /control")
}

fn run() -> i32 {
    let matches = App::new("ssg")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A storage gateway: token-leased streaming of blobs in and out of backing stores")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("server")
                .about("Run the storage gateway")
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .env("SSG_CONFIG")
                        .takes_value(true)
                        .help("Path to the YAML configuration file"),
                )
                .arg(
                    Arg::with_name("log-level")
                        .long("log-level")
                        .takes_value(true)
                        .default_value("info")
                        .help("Minimum level of log messages to emit"),
                )
                .arg(
                    Arg::with_name("json-log")
                        .long("json-log")
                        .help("Force JSON log output even on a tty"),
                ),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("Check that a gateway is alive")
                .arg(url_arg())
                .arg(token_arg()),
        )
        .subcommand(
            SubCommand::with_name("buckets")
                .about("List the configured buckets")
                .arg(url_arg())
                .arg(token_arg()),
        )
        .subcommand(
            SubCommand::with_name("streams")
                .about("List the currently active streams")
                .arg(url_arg())
                .arg(token_arg()),
        )
        .subcommand(
            SubCommand::with_name("control")
                .about("Issue raw control-plane operations")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("upload")
                        .about("Start an upload stream")
                        .arg(Arg::with_name("target").required(true))
                        .arg(url_arg())
                        .arg(token_arg()),
                )
                .subcommand(
                    SubCommand::with_name("download")
                        .about("Start a download stream")
                        .arg(Arg::with_name("target").required(true))
                        .arg(url_arg())
                        .arg(token_arg()),
                )
                .subcommand(
                    SubCommand::with_name("expunge")
                        .about("Delete a blob and its cipher record")
                        .arg(Arg::with_name("target").required(true))
                        .arg(url_arg())
                        .arg(token_arg()),
                ),
        )
        .subcommand(
            SubCommand::with_name("stream")
                .about("Drive an already-issued stream")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("put")
                        .about("Send stdin into an upload stream")
                        .arg(Arg::with_name("id").required(true))
                        .arg(url_arg())
                        .arg(stream_token_arg()),
                )
                .subcommand(
                    SubCommand::with_name("get")
                        .about("Write a download stream to stdout")
                        .arg(Arg::with_name("id").required(true))
                        .arg(url_arg())
                        .arg(stream_token_arg()),
                ),
        )
        .subcommand(
            SubCommand::with_name("upload")
                .about("Upload stdin to a target URL (control + data plane)")
                .arg(Arg::with_name("target").required(true))
                .arg(url_arg())
                .arg(token_arg()),
        )
        .subcommand(
            SubCommand::with_name("download")
                .about("Download a target URL to stdout (control + data plane)")
                .arg(Arg::with_name("target").required(true))
                .arg(url_arg())
                .arg(token_arg()),
        )
        .get_matches();

    match matches.subcommand() {
        ("server", Some(m)) => cmd_server(m),
        ("ping", Some(m)) => with_client(m, |c| {
            println!("{}", c.ping()?);
            Ok(())
        }),
        ("buckets", Some(m)) => with_client(m, |c| {
            for b in c.buckets()? {
                println!(
                    "{}\t{}\t(compression: {}, encryption: {})",
                    b.key, b.name, b.compression, b.encryption
                );
                if !b.description.is_empty() {
                    println!("\t{}", b.description);
                }
            }
            Ok(())
        }),
        ("streams", Some(m)) => with_client(m, |c| {
            for s in c.streams()? {
                println!(
                    "{}\t{}\t{}\texpires {}\t{} bytes",
                    s.kind, s.id, s.canon, s.expires, s.received
                );
            }
            Ok(())
        }),
        ("control", Some(m)) => match m.subcommand() {
            ("upload", Some(sub)) => control_cmd("upload", sub),
            ("download", Some(sub)) => control_cmd("download", sub),
            ("expunge", Some(sub)) => control_cmd("expunge", sub),
            _ => EXIT_USAGE,
        },
        ("stream", Some(m)) => match m.subcommand() {
            ("put", Some(sub)) => {
                let id = sub.value_of("id").unwrap_or_default().to_owned();
                let token = match sub.value_of("stream-token") {
                    Some(t) => t.to_owned(),
                    None => return usage("no stream token supplied (use --stream-token)"),
                };
                with_client(sub, move |c| {
                    let rsp = c.put_stream(&id, &token, &mut io::stdin().lock())?;
                    eprintln!(
                        "sent {} segments; {} bytes ({} on the wire)",
                        rsp.segments, rsp.uncompressed, rsp.compressed
                    );
                    Ok(())
                })
            }
            ("get", Some(sub)) => {
                let id = sub.value_of("id").unwrap_or_default().to_owned();
                let token = match sub.value_of("stream-token") {
                    Some(t) => t.to_owned(),
                    None => return usage("no stream token supplied (use --stream-token)"),
                };
                with_client(sub, move |c| {
                    c.get_blob(&id, &token, &mut io::stdout().lock())?;
                    Ok(())
                })
            }
            _ => EXIT_USAGE,
        },
        ("upload", Some(m)) => {
            let target = m.value_of("target").unwrap_or_default().to_owned();
            with_client(m, move |c| {
                let (ticket, outcome) = c.upload(&target, &mut io::stdin().lock())?;
                eprintln!(
                    "uploaded {} bytes ({} on the wire) in {} segments",
                    outcome.uncompressed, outcome.compressed, outcome.segments
                );
                println!("{}", ticket.canon);
                Ok(())
            })
        }
        ("download", Some(m)) => {
            let target = m.value_of("target").unwrap_or_default().to_owned();
            with_client(m, move |c| {
                c.download(&target, &mut io::stdout().lock())?;
                Ok(())
            })
        }
        _ => EXIT_USAGE,
    }
}

fn usage(message: &str) -> i32 {
    eprintln!("ssg: {}", message);
    EXIT_USAGE
}

fn control_cmd(kind: &str, sub: &ArgMatches) -> i32 {
    let target = sub.value_of("target").unwrap_or_default().to_owned();
    with_client(sub, move |c| {
        let rsp = c.control(kind, &target)?;
        println!("kind:    {}", rsp.kind);
        if !rsp.id.is_empty() {
            println!("id:      {}", rsp.id);
            println!("token:   {}", rsp.token);
        }
        println!("canon:   {}", rsp.canon);
        if let Some(expires) = rsp.expires {
            println!("expires: {}", expires.to_rfc3339());
        }
        Ok(())
    })
}

/// Builds a client from the shared --url/--token arguments and maps the
/// outcome onto the documented exit codes.
fn with_client<F>(m: &ArgMatches, f: F) -> i32
where
    F: FnOnce(&Client) -> Result<(), ClientError>,
{
    let base = match m.value_of("url") {
        Some(u) => u.to_owned(),
        None => return usage("no gateway URL supplied (use --url or $SSG_URL)"),
    };
    let token = m.value_of("token").map(|t| t.to_owned());

    match f(&Client::new(&base, token)) {
        Ok(()) => EXIT_OK,
        Err(ClientError::BadResponse(e)) => {
            eprintln!("ssg: {}", e);
            EXIT_ENCODING
        }
        Err(e) => {
            eprintln!("ssg: {}", e);
            EXIT_REMOTE
        }
    }
}

fn cmd_server(m: &ArgMatches) -> i32 {
    let config_path = match m.value_of("config") {
        Some(p) => p.to_owned(),
        None => return usage("no configuration file specified (use --config or $SSG_CONFIG)"),
    };

    let config = match config::read_file(&config_path) {
        Ok(c) => c,
        Err(e) => return usage(&format!("{}: {}", config_path, e)),
    };

    let format = if m.is_present("json-log") {
        LogFormat::Json
    } else {
        LogFormat::Auto
    };
    let (logger, _guard) = match setup_logging(&LoggingConfiguration {
        format,
        version: env!("CARGO_PKG_VERSION"),
        level: m.value_of("log-level").unwrap_or("info"),
    }) {
        Ok(l) => l,
        Err(e) => return usage(&format!("{}", e)),
    };

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("ssg: failed to start runtime: {}", e);
            return EXIT_REMOTE;
        }
    };

    let server = match Server::new(config, runtime.handle(), &logger) {
        Ok(s) => Arc::new(s),
        Err(e) => return usage(&format!("{}", e)),
    };

    info!(logger, "ssg starting up";
          "cluster" => &server.cluster,
          "bind" => &server.bind,
          "max_lease_seconds" => server.max_lease.num_seconds(),
          "sweep_interval_seconds" => server.sweep_interval.as_secs());

    let outcome = runtime.block_on(async {
        tokio::spawn(server.clone().sweeper());
        api::serve(server).await
    });

    match outcome {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("ssg: {}", e);
            EXIT_REMOTE
        }
    }
}
