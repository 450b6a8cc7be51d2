//! CLI command definitions and dispatch.

mod add_user;
mod add_wish;
mod check_image;
mod convert;
mod driver;
mod gc;
mod images;
mod manifest;
mod needed_layers;
mod remove_converted;
mod remove_wish;
mod set_recipe;
mod users;
mod version;
mod wishes;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thinimage_core::{ImageRef, ThinConfig};
use thinimage_runtime::{ConversionDb, JsonDatabase, RegistryAuth};

/// Thin image conversion and store-backed graph driver.
#[derive(Parser)]
#[command(name = "thinimage", version, about)]
pub struct Cli {
    /// Configuration file (default: $THINIMAGE_CONFIG or ~/.thinimage/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print listings as CSV
    #[arg(long, global = true)]
    pub machine: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Store registry credentials for a user
    AddUser(add_user::AddUserArgs),
    /// List users with stored credentials
    Users(users::UsersArgs),
    /// Request the conversion of an image
    AddWish(add_wish::AddWishArgs),
    /// List conversion requests
    Wishes(wishes::WishesArgs),
    /// Remove a conversion request
    RemoveWish(remove_wish::RemoveWishArgs),
    /// Replace the wishes of a recipe file's repository with the ones it lists
    SetRecipe(set_recipe::SetRecipeArgs),
    /// Check that an image reference parses and its manifest is reachable
    CheckImage(check_image::CheckImageArgs),
    /// Print the manifest of an image as JSON
    Manifest(manifest::ManifestArgs),
    /// List known images
    Images(images::ImagesArgs),
    /// Convert every recorded wish once
    Convert(convert::ConvertArgs),
    /// Convert every recorded wish repeatedly until interrupted
    Loop(convert::LoopArgs),
    /// Delete store layers no conversion needs anymore
    Gc(gc::GcArgs),
    /// List store layers recorded conversions still need
    NeededLayers(needed_layers::NeededLayersArgs),
    /// Forget conversions and schedule their manifests for removal
    RemoveConverted(remove_converted::RemoveConvertedArgs),
    /// Inspect the graph driver state
    #[command(subcommand)]
    Driver(driver::DriverCommand),
    /// Show version information
    Version(version::VersionArgs),
}

/// Settings shared by every command.
pub struct Context {
    pub config: ThinConfig,
    pub machine: bool,
}

impl Context {
    pub fn load(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            config: ThinConfig::load(cli.config.as_deref())?,
            machine: cli.machine,
        })
    }

    /// Open the bookkeeping database; failing here is fatal for every command.
    pub fn open_db(&self) -> Result<Arc<dyn ConversionDb>, Box<dyn std::error::Error>> {
        let db = JsonDatabase::open(&self.config.database.path)?;
        Ok(Arc::new(db))
    }
}

/// Registry credentials of `user`, anonymous without a user.
pub(crate) fn registry_auth(
    db: &dyn ConversionDb,
    user: Option<&str>,
    reference: &ImageRef,
) -> Result<RegistryAuth, Box<dyn std::error::Error>> {
    let Some(user) = user else {
        return Ok(RegistryAuth::anonymous());
    };
    match db.get_credential(user, &reference.registry)? {
        Some(password) => Ok(RegistryAuth::basic(user, password)),
        None => Err(format!("No credentials of {} for {}", user, reference.registry).into()),
    }
}

/// Flag raised on the first Ctrl-C.
pub(crate) fn interrupt_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing the current layer");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load(&cli)?;
    match cli.command {
        Command::AddUser(args) => add_user::execute(args, &ctx).await,
        Command::Users(args) => users::execute(args, &ctx).await,
        Command::AddWish(args) => add_wish::execute(args, &ctx).await,
        Command::Wishes(args) => wishes::execute(args, &ctx).await,
        Command::RemoveWish(args) => remove_wish::execute(args, &ctx).await,
        Command::SetRecipe(args) => set_recipe::execute(args, &ctx).await,
        Command::CheckImage(args) => check_image::execute(args, &ctx).await,
        Command::Manifest(args) => manifest::execute(args, &ctx).await,
        Command::Images(args) => images::execute(args, &ctx).await,
        Command::Convert(args) => convert::execute(args, &ctx).await,
        Command::Loop(args) => convert::execute_loop(args, &ctx).await,
        Command::Gc(args) => gc::execute(args, &ctx).await,
        Command::NeededLayers(args) => needed_layers::execute(args, &ctx).await,
        Command::RemoveConverted(args) => remove_converted::execute(args, &ctx).await,
        Command::Driver(command) => driver::execute(command, &ctx).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        let mut config = ThinConfig::default();
        config.database.path = dir.path().join("db/database.json");
        Context {
            config,
            machine: false,
        }
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["thinimage", "wishes", "--machine", "-v"]).unwrap();
        assert!(cli.machine);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Wishes(_)));
    }

    #[test]
    fn test_cli_parses_convert_flags() {
        let cli = Cli::try_parse_from(["thinimage", "convert", "-g", "-f"]).unwrap();
        match cli.command {
            Command::Convert(args) => {
                assert!(args.convert_again);
                assert!(args.overwrite_layers);
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn test_cli_parses_driver_subcommand() {
        let cli = Cli::try_parse_from(["thinimage", "driver", "resolve", "abc"]).unwrap();
        assert!(matches!(cli.command, Command::Driver(driver::DriverCommand::Resolve(_))));
    }

    #[test]
    fn test_open_db_creates_parent() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let db = ctx.open_db().unwrap();
        assert!(db.list_wishes().unwrap().is_empty());
        assert!(dir.path().join("db").exists());
    }
}
