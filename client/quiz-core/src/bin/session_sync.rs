use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_core::{config::Config, services::CoreState};

/// Pushes locally buffered quiz sessions to the server and reports the
/// session the learner should resume.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "quiz_core=debug".into()),
    );
    if wants_json_logs(std::env::var("QUIZ_LOG_FORMAT").ok().as_deref()) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = Config::load().context("Failed to load configuration")?;
    let token = config
        .api_token
        .clone()
        .context("QUIZ_API_TOKEN is required to reconcile sessions")?;

    let mut state = CoreState::new(config).context("Failed to initialize quiz core")?;
    let report = state
        .authenticate(&token)
        .await
        .context("Reconciliation failed")?;

    for failure in &report.failed {
        tracing::error!("Not synced: {} ({})", failure.key, failure.error);
    }
    match &report.resume {
        Some(session) => tracing::info!(
            "Resume quiz {} (session {}, {}% done)",
            session.quiz_id(),
            session.id,
            session.progress_percentage
        ),
        None => tracing::info!("No session to resume"),
    }

    match quiz_core::metrics::render_metrics() {
        Ok(text) => tracing::debug!("Metrics:\n{}", text),
        Err(e) => tracing::warn!("Failed to render metrics: {}", e),
    }

    if !report.is_clean() {
        anyhow::bail!("{} buffered sessions could not be synced", report.failed.len());
    }
    Ok(())
}

/// `QUIZ_LOG_FORMAT=json` switches to one JSON object per log line.
fn wants_json_logs(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_logs_only_when_asked() {
        assert!(wants_json_logs(Some("json")));
        assert!(wants_json_logs(Some(" JSON ")));
        assert!(!wants_json_logs(Some("pretty")));
        assert!(!wants_json_logs(None));
    }
}
