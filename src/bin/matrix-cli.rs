//! Command-line driver for a Matrix homeserver.
//!
//! Logs in, optionally syncs, and prints what the server said. Use `--help`
//! to see the options.

use std::time::Duration;

use clap::{arg, value_parser, ArgAction, ArgMatches};
use color_eyre::eyre::{eyre, WrapErr as _};
use matrix_driver::codec::matrix::{MatrixClient, MatrixCodec, Response};
use matrix_driver::codec::SyncOptions;
use matrix_driver::negotiate::TlsStream;
use matrix_driver::session::TracingObserver;
use matrix_driver::{
    Command, ConnectionTarget, Error, Negotiator, NegotiatorConfig, Session, SessionConfig,
};
use tracing::{Instrument as _, Level};
use tracing_subscriber::{
    filter::Targets, layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _,
};

type MatrixSession = Session<TlsStream, MatrixCodec>;

fn command() -> clap::Command {
    clap::Command::new("matrix-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Matrix client driver")
        .args([
            clap::Arg::new("host")
                .help("Homeserver address, as HOST[:PORT]")
                .required(true),
            clap::Arg::new("user")
                .help("User to log in as")
                .required(true),
            clap::Arg::new("password")
                .help("Password for the user")
                .required(true),
            arg!(--verbosity [LEVEL] "Diagnostic output on stderr")
                .value_parser(["error", "warning", "info"])
                .default_value("error"),
            clap::Arg::new("strict-tls")
                .long("strict-tls")
                .help("Validate the server certificate against the platform roots")
                .action(ArgAction::SetTrue),
            arg!(--timeout [SECONDS] "Give up on a read after this many seconds")
                .value_parser(value_parser!(u64).range(1..)),
        ])
        .subcommand_required(true)
        .subcommand(clap::Command::new("login").about("Log in and print the access token"))
        .subcommand(
            clap::Command::new("sync")
                .about("Log in, then sync and print the response")
                .args([
                    arg!(--since [TOKEN] "Batch token from a previous sync"),
                    clap::Arg::new("full-state")
                        .long("full-state")
                        .help("Request the full state of every room")
                        .action(ArgAction::SetTrue),
                ]),
        )
}

fn init_tracing(verbosity: &str) {
    let level = match verbosity {
        "info" => Level::INFO,
        "warning" => Level::WARN,
        _ => Level::ERROR,
    };

    let filter = Targets::new().with_default(level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = command().get_matches();

    init_tracing(
        args.get_one::<String>("verbosity")
            .map(String::as_str)
            .unwrap_or("error"),
    );

    let _ = rustls::crypto::ring::default_provider().install_default();

    let host = args
        .get_one::<String>("host")
        .ok_or_else(|| eyre!("missing host"))?;
    let user = args
        .get_one::<String>("user")
        .ok_or_else(|| eyre!("missing user"))?;
    let password = args
        .get_one::<String>("password")
        .ok_or_else(|| eyre!("missing password"))?;

    let target = ConnectionTarget::parse(host, user.as_str())?;
    let config =
        NegotiatorConfig::default().with_insecure_skip_verify(!args.get_flag("strict-tls"));
    let session_config = SessionConfig::default()
        .with_read_timeout(args.get_one::<u64>("timeout").copied().map(Duration::from_secs));

    let span = tracing::info_span!("session", address = %target, user = target.user());
    let stream = Negotiator::new(config)?
        .negotiate(&target)
        .instrument(span.clone())
        .await
        .wrap_err_with(|| format!("connecting to {target}"))?;
    tracing::info!(parent: &span, transport = %stream.transport(), "connected");

    let mut session = Session::new(
        stream,
        MatrixClient::for_target(&target),
        target.user(),
        TracingObserver::new(span),
    )
    .with_config(session_config);

    match args.subcommand() {
        Some(("login", _)) => {
            let result = login(&mut session, password).await;
            let response = session.finish(result).await?;
            eprintln!("{response}");

            let token = response
                .access_token()
                .ok_or_else(|| eyre!("login failed: {response}"))?;
            println!("{token}");
        }
        Some(("sync", matches)) => {
            let options = sync_options(matches);
            let result = sync(&mut session, password, options).await;
            let response = session.finish(result).await?;
            println!("{response}");

            if response.is_error() {
                return Err(eyre!("sync failed"));
            }
        }
        _ => return Err(eyre!("no subcommand given")),
    }

    Ok(())
}

fn sync_options(matches: &ArgMatches) -> SyncOptions {
    let mut options = SyncOptions::default().full_state(matches.get_flag("full-state"));
    if let Some(since) = matches.get_one::<String>("since") {
        options = options.since(since.as_str());
    }
    options
}

async fn login(session: &mut MatrixSession, password: &str) -> Result<Response, Error> {
    session.connect().await?;
    session.login(password).await
}

/// Sync after logging in. A failed login is returned instead of syncing.
async fn sync(
    session: &mut MatrixSession,
    password: &str,
    options: SyncOptions,
) -> Result<Response, Error> {
    session.connect().await?;
    let login = session.login(password).await?;
    if login.is_error() {
        return Ok(login);
    }
    session.command(&Command::Sync(options)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_command() {
        command().debug_assert();
    }

    #[test]
    fn parses_sync_options() {
        let args = command()
            .try_get_matches_from([
                "matrix-cli",
                "--strict-tls",
                "example.org:8448",
                "alice",
                "hunter2",
                "sync",
                "--since",
                "s1",
                "--full-state",
            ])
            .unwrap();

        assert!(args.get_flag("strict-tls"));
        assert_eq!(args.get_one::<String>("verbosity").unwrap(), "error");

        let (name, matches) = args.subcommand().unwrap();
        assert_eq!(name, "sync");
        let options = sync_options(matches);
        assert_eq!(options.since.as_deref(), Some("s1"));
        assert!(options.full_state);
    }

    #[test]
    fn rejects_unknown_verbosity() {
        assert!(command()
            .try_get_matches_from(["matrix-cli", "--verbosity", "debug", "h", "u", "p", "login"])
            .is_err());
    }
}
