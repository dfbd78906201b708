use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use converge_common::{InstanceRecord, InstanceSpec};
use converge_orchestrator::provider_manager::ProviderManager;
use converge_orchestrator::settings::Settings;
use converge_orchestrator::Reconciler;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const USAGE: &str = "usage: converge-orchestrator apply <declaration.json> [record.json]\n       converge-orchestrator delete <record.json>";

fn read_json<T: DeserializeOwned>(path: &str) -> Result<T> {
    let raw = fs::read_to_string(Path::new(path)).with_context(|| format!("reading {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let settings = Settings::from_env();
    info!("🚀 [converge] provider={} config={:?}", settings.provider, settings.reconcile);

    let client = ProviderManager::get_provider(&settings.provider)
        .ok_or_else(|| anyhow!("provider '{}' is not available in this build", settings.provider))?;

    let cancel = CancellationToken::new();
    if let Some(deadline) = settings.deadline {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!("⏱️ [converge] deadline of {:?} reached, cancelling", deadline);
            token.cancel();
        });
    }
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 [converge] interrupted, cancelling");
            token.cancel();
        }
    });

    let reconciler = Reconciler::new(client, settings.reconcile_config()).with_cancellation(cancel);

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["apply", declaration, rest @ ..] if rest.len() <= 1 => {
            let desired: InstanceSpec = read_json(declaration)?;
            let baseline: Option<InstanceRecord> = match rest.first() {
                Some(path) => Some(read_json(path)?),
                None => None,
            };
            match reconciler.reconcile(&desired, baseline.as_ref()).await {
                Ok(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(())
                }
                Err(e) => {
                    if let Some(instance_id) = e.orphaned_instance() {
                        error!("❌ [converge] instance {} exists but did not converge", instance_id);
                    }
                    Err(e.into())
                }
            }
        }
        ["delete", record] => {
            let record: InstanceRecord = read_json(record)?;
            reconciler.delete(&record).await?;
            info!("✅ [converge] instance {} deleted", record.instance_id());
            Ok(())
        }
        _ => bail!(USAGE),
    }
}
