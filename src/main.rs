use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use kitsas_addon::{init_tracing, AddonCall, AddonOptions, KitsasAddon, LogStatus, MaintenanceRouter};
use serde_json::json;

async fn index(call: AddonCall) -> Response {
    let visits = call.get_as::<u64>("visits").unwrap_or(0) + 1;
    if let Err(err) = call.set("visits", visits).await {
        tracing::warn!(error = %err, "could not store visit counter");
    }
    Json(json!({
        "user": call.user_name(),
        "organization": call.organization_name(),
        "language": call.language(),
        "active": call.is_active(),
        "visits": visits,
    }))
    .into_response()
}

async fn log_visit(call: AddonCall) -> Response {
    match call
        .log(LogStatus::Info, "Addon opened", Some(call.log_info()))
        .await
    {
        Ok(()) => "logged".into_response(),
        Err(err) => {
            tracing::error!(error = %err, "writing addon log failed");
            (axum::http::StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reads RUST_LOG, defaults to info.
    init_tracing();

    let mut addon = KitsasAddon::new(AddonOptions::default())?;
    addon
        .create_default_router()
        .route("/", get(index))
        .route("/log", get(log_visit));

    let maintenance = MaintenanceRouter::new(&mut addon, None);
    maintenance.add_function("ping", || async {
        tracing::info!("maintenance ping");
        Ok::<(), anyhow::Error>(())
    });

    addon.start().await?;
    Ok(())
}
