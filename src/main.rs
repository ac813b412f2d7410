mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, PolicyAction, ReconcileAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("pgguard_storage_operator=info".parse()?))
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::List { resource } => commands::list::run(resource).await?,
        Commands::Analyze => commands::analyze::run().await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Policy { action } => match action {
            PolicyAction::BundleList => commands::policy::bundle_list()?,
            PolicyAction::BundleShow { name } => commands::policy::bundle_show(&name)?,
            PolicyAction::BundleApply { name, namespace, policy_name } => commands::policy::bundle_apply(&name, &namespace, &policy_name)?,
            PolicyAction::Export { namespace } => commands::policy::export(&namespace).await?,
            PolicyAction::Import { file, dry_run } => commands::policy::import(&file, dry_run).await?,
            PolicyAction::Diff { file } => commands::policy::diff(&file).await?,
        },
        Commands::Reconcile { action } => match action {
            ReconcileAction::Serve { addr } => {
                let socket_addr = addr.parse()?;
                commands::reconcile::run(socket_addr).await?;
            }
        },
    }

    Ok(())
}
