use evstore_admin::{ProjectionDetails, ProjectionsManager};
use evstore_core::http::HttpClient;
use evstore_core::{ConnectionSettings, EndPoint, TlsConfig};

use crate::ProjectionKind;

pub async fn list(settings: &ConnectionSettings, endpoint: EndPoint, kind: ProjectionKind) -> anyhow::Result<()> {
    let client = if settings.use_tls {
        HttpClient::with_tls(TlsConfig::for_validation(settings.validate_server)?, settings.operation_timeout)
    } else {
        HttpClient::plain(settings.operation_timeout)
    };
    let mut manager = ProjectionsManager::new(endpoint, client);
    if let Some(credentials) = &settings.default_credentials {
        manager = manager.with_default_credentials(credentials.clone());
    }

    let projections = match kind {
        ProjectionKind::All => manager.list_all(None).await?,
        ProjectionKind::Continuous => manager.list_continuous(None).await?,
        ProjectionKind::OneTime => manager.list_one_time(None).await?,
    };
    if projections.is_empty() {
        println!("No projections.");
        return Ok(());
    }
    println!("{}", render_table(&projections));
    Ok(())
}

fn render_table(projections: &[ProjectionDetails]) -> String {
    let width = projections.iter().map(|p| p.name.len()).max().unwrap_or(0).max(4);
    let mut out = format!("{:<width$}  {:<12}  {:<12}  {:>8}", "NAME", "MODE", "STATUS", "PROGRESS");
    for p in projections {
        out.push_str(&format!(
            "\n{:<width$}  {:<12}  {:<12}  {:>7.1}%",
            p.name, p.mode, p.status, p.progress
        ));
    }
    out
}
