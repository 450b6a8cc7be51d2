//! `thinimage add-user` command.

use clap::Args;

use super::Context;

#[derive(Args)]
pub struct AddUserArgs {
    /// User name, as referenced by wishes and recipes
    #[arg(short, long)]
    pub username: String,

    /// Registry host the credentials are for
    #[arg(short, long)]
    pub registry: String,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

pub async fn execute(args: AddUserArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let password = if args.password_stdin {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        input.trim().to_string()
    } else {
        match args.password {
            Some(p) => p,
            None => {
                eprint!("Password: ");
                let mut input = String::new();
                std::io::stdin().read_line(&mut input)?;
                input.trim().to_string()
            }
        }
    };

    let db = ctx.open_db()?;
    db.add_credential(&args.username, &args.registry, &password)?;

    println!("Stored credentials of {} for {}", args.username, args.registry);
    Ok(())
}
