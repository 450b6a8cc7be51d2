//! `thinimage manifest` command.

use clap::Args;
use thinimage_core::ImageRef;
use thinimage_runtime::{ImageSource, OciRegistry};

use super::{registry_auth, Context};

#[derive(Args)]
pub struct ManifestArgs {
    /// Image reference with scheme
    pub reference: String,

    /// User whose credentials access the registry
    #[arg(short, long)]
    pub user: Option<String>,
}

pub async fn execute(args: ManifestArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageRef::parse(&args.reference)?;
    let db = ctx.open_db()?;
    let auth = registry_auth(db.as_ref(), args.user.as_deref(), &reference)?;
    let fetched = OciRegistry::new().fetch_manifest(&reference, &auth).await?;
    println!("{}", serde_json::to_string_pretty(&fetched.manifest)?);
    Ok(())
}
