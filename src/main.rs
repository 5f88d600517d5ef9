use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use martingale_perps_bot::alert::{AlertEvent, AlertSink, NullSink, TelegramSink};
use martingale_perps_bot::config::EngineConfig;
use martingale_perps_bot::exchange::PhemexAdapter;
use martingale_perps_bot::logging::{log, obj, v_str, Domain, Level};
use martingale_perps_bot::workflow::{self, Outcome};

/// One run is one tick: load config, build the adapter, run every configured
/// instrument to completion (isolated from one another), then exit.
/// Exit code is 0 unless configuration or adapter construction itself fails
/// (spec section 6) -- a per-instrument error is reported and logged, never
/// escalated to a process failure.
#[tokio::main]
async fn main() -> Result<()> {
    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            log(Level::Error, Domain::System, "startup.config_failed", obj(&[("error", v_str(e.to_string()))]));
            return Err(e.into());
        }
    };

    let exchange = PhemexAdapter::new(
        config.phemex_base.clone(),
        config.api_key.clone(),
        config.api_secret.clone(),
        config.rate_limit_per_sec,
        config.http_timeout_secs,
    )?;

    let alert_sink: Arc<dyn AlertSink> = match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Arc::new(TelegramSink::new(token.clone(), chat_id.clone())),
        _ => Arc::new(NullSink),
    };

    if config.bot_startup_alert {
        alert_sink
            .send(&AlertEvent::Started {
                instruments: config.instruments.iter().map(|i| i.symbol.clone()).collect(),
                testnet: config.testnet,
            })
            .await;
    }

    log(
        Level::Info,
        Domain::System,
        "tick.start",
        obj(&[
            ("instruments", v_str(config.instruments.iter().map(|i| i.symbol.clone()).collect::<Vec<_>>().join(","))),
            ("testnet", serde_json::json!(config.testnet)),
        ]),
    );

    // One deadline for the whole tick (spec section 5), not one per
    // instrument: each instrument's timeout is whatever is left of the
    // overall budget when its turn comes up.
    let tick_deadline = tokio::time::Instant::now() + Duration::from_secs(config.tick_deadline_secs);
    let mut any_errors = false;

    for instrument in &config.instruments {
        let remaining = tick_deadline.duration_since(tokio::time::Instant::now());
        let outcome = if remaining.is_zero() {
            let message = format!("tick deadline of {}s elapsed before this instrument could run", config.tick_deadline_secs);
            log(
                Level::Error,
                Domain::System,
                "tick.deadline_exceeded",
                obj(&[("symbol", v_str(instrument.symbol.clone())), ("message", v_str(message.clone()))]),
            );
            Outcome::Error { stage: "deadline", kind: "Cancelled".to_string(), message }
        } else {
            match tokio::time::timeout(remaining, workflow::run_instrument(&exchange, alert_sink.as_ref(), instrument)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let message = format!("tick deadline of {}s elapsed", config.tick_deadline_secs);
                    log(
                        Level::Error,
                        Domain::System,
                        "tick.deadline_exceeded",
                        obj(&[("symbol", v_str(instrument.symbol.clone())), ("message", v_str(message.clone()))]),
                    );
                    Outcome::Error { stage: "deadline", kind: "Cancelled".to_string(), message }
                }
            }
        };

        if matches!(outcome, Outcome::Error { .. }) {
            any_errors = true;
        }
    }

    log(
        Level::Info,
        Domain::System,
        "tick.complete",
        obj(&[("hadErrors", serde_json::json!(any_errors))]),
    );

    // Per-instrument failures are reported (logged + alerted) but never turn
    // into a nonzero process exit: a supervising scheduler should re-tick
    // regardless, per spec section 6.
    Ok(())
}
