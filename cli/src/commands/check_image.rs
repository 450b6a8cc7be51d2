//! `thinimage check-image` command.

use clap::Args;
use thinimage_core::ImageRef;
use thinimage_runtime::{ImageSource, OciRegistry};

use super::{registry_auth, Context};

#[derive(Args)]
pub struct CheckImageArgs {
    /// Image reference with scheme, e.g. https://registry.hub.docker.com/library/redis:4
    pub reference: String,

    /// User whose credentials access the registry
    #[arg(short, long)]
    pub user: Option<String>,
}

pub async fn execute(

    args: CheckImageArgs,

    ctx: &Context,

) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageRef::parse(&args.reference)?;
    println!("Scheme:      {}", reference.scheme);
    println!("Registry:    {}", reference.registry);
    println!("Repository:  {}", reference.repository);
    println!("Tag:         {}", reference.tag.as_deref().unwrap_or("<none>"));
    println!("Digest:      {}", reference.digest.as_deref().unwrap_or("<none>"));

    let db = ctx.open_db()?;
    let auth = registry_auth(db.as_ref(), args.user.as_deref(), &reference)?;
    let fetched = OciRegistry::new().fetch_manifest(&reference, &auth).await?;

    println!("Manifest:    {}", fetched.digest);
    println!("Config:      {}", fetched.manifest.config_digest());
    println!("Layers:      {}", fetched.manifest.layers.len());
    if let Some(image) = db.get_image(&reference)? {
        println!("Known as:    image {}{}", image.id, if image.is_thin { " (thin)" } else { "" });
    }
    Ok(())
}
