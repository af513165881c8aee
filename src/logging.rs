use std::io::Write;
use std::sync::Once;

use chrono::Utc;

static INIT: Once = Once::new();

/// Install the global logger. Safe to call more than once.
///
/// `RUST_LOG` overrides the default filter (`info`, or `debug` when `verbose`).
/// `LOG_FORMAT=json` switches to one JSON object per line.
pub fn init(verbose: bool) {
    INIT.call_once(|| {
        let default = if verbose { "debug" } else { "info" };
        let json = std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default));
        builder.format(move |buf, record| {
            let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            if json {
                let obj = serde_json::json!({
                    "ts": ts,
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{}", obj)
            } else {
                writeln!(
                    buf,
                    "{} {:<5} {} {}",
                    ts,
                    record.level(),
                    record.target(),
                    record.args()
                )
            }
        });

        // Tests may have installed a logger already
        let _ = builder.try_init();
    });
}
