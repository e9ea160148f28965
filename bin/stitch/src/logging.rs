//! Logging setup for the stitch node.

use eyre::Result;
use tracing_subscriber::EnvFilter;

use crate::cli::LogArgs;

/// Initialize the tracing subscriber from command line arguments.
///
/// `--quiet` wins over everything and shows errors only. Otherwise the base
/// level comes from `RUST_LOG` when set, falling back to the `-v` count,
/// and `--log.filter` directives are layered on top.
pub fn init_logging(args: &LogArgs) -> Result<()> {
    let filter = if args.quiet {
        EnvFilter::new("error")
    } else {
        let base_level = match args.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base_level));

        if let Some(custom) = &args.filter {
            for directive in custom.split(',') {
                match directive.parse() {
                    Ok(directive) => filter = filter.add_directive(directive),
                    Err(error) => eprintln!("ignoring log directive `{directive}`: {error}"),
                }
            }
        }
        filter
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .init();

    Ok(())
}
