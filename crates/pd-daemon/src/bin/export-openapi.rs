//! Dumps the OpenAPI document to stdout.

use anyhow::Result;
use utoipa::OpenApi;

use pd_daemon::server::docs::ApiDoc;

fn main() -> Result<()> {
    println!("{}", ApiDoc::openapi().to_pretty_json()?);
    Ok(())
}
