use std::io::Write;

use log::LevelFilter;

/// Installs the console logger shared by both binaries.
///
/// `--debug` lowers the default level to Debug; `RUST_LOG` still wins when set.
pub fn init(debug: bool) {
    let default_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(default_level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} | {:<7} | {:<7} | {}",
                buf.timestamp_millis(),
                short_target(record.target()),
                record.level(),
                record.args()
            )
        });

    // a second init (tests, embedding) keeps the first logger
    let _ = builder.try_init();
}

fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}
