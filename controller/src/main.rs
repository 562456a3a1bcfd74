use std::net::SocketAddr;

use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nhc_controller::{metrics::Metrics, *};

fn main() {
    use clap::{Arg, Command, crate_authors, crate_description, crate_name, crate_version};
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run")
            .about("run the metrics introspection server")
            .args([Arg::new("introspection_address")
                .long("introspection-bind-address")
                .env("INTROSPECTION_BIND_ADDRESS")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089")])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(Error::from(e)),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    introspection_address: SocketAddr,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            introspection_address: m
                .get_one::<String>("introspection_address")
                .map(String::as_str)
                .unwrap_or_default()
                .parse()?,
        })
    }
}

fn startup(args: Args) -> nhc_controller::Result<()> {
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;

    // Registration failures abort startup before anything is served.
    let registry = prometheus::Registry::new();
    let metrics = Metrics::new(registry.clone())?;
    metrics.initialize()?;
    let ctx = Context::new(metrics);
    info!(initialized = ctx.metrics.is_initialized(), "metrics ready");

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    let stop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        stop.cancel();
    });
    rt.block_on(introspection::serve(
        args.introspection_address,
        registry,
        token,
    ))
}
