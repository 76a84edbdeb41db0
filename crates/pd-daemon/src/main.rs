use anyhow::Result;

use pd_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("port-daddyd")?;
    pd_daemon::server::run().await
}
