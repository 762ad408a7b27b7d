//! Small demo CLI wiring the `authbridge` library together. Stands in for
//! an external caller of the library API (the real wire contract is the
//! set of public functions each module documents), not a re-implementation
//! of the HTTP routes.

use authbridge::model::ServiceLink;
use authbridge::token_service::IssueRequest;
use authbridge::BridgeContext;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "authbridge-admin", about = "Administer an Auth Bridge trust broker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print backend liveness, current signing kid, and cache sizes.
    Diagnostics,
    /// Rotate the RSA signing key, keeping old kids verifiable.
    RotateKeys,
    /// Register a directed trust link between two services in a workspace.
    Link {
        workspace_id: String,
        issuer_service_id: String,
        audience_service_id: String,
    },
    /// Mint a token for an issuer calling an audience inside a workspace.
    IssueToken {
        workspace_id: String,
        issuer_service_id: String,
        audience_service_id: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = BridgeContext::from_env()?;

    match cli.command {
        Command::Diagnostics => diagnostics(&ctx)?,
        Command::RotateKeys => {
            let kid = ctx.keys.rotate(&ctx.backend)?;
            println!("rotated signing key, new kid: {kid}");
        }
        Command::Link { workspace_id, issuer_service_id, audience_service_id } => {
            let workspace = ctx.store().get_workspace(&workspace_id)?;
            let link = ServiceLink { issuer_id: issuer_service_id, audience_id: audience_service_id, context: None };
            let workspace = ctx.store().link_service(workspace, link, None)?;
            println!("workspace {} now has {} link(s)", workspace.base.id, workspace.services.len());
        }
        Command::IssueToken { workspace_id, issuer_service_id, audience_service_id } => {
            let token = ctx.token_service().issue(IssueRequest {
                issuer_service_id,
                audience_service_id,
                workspace_id,
                caller_claims: Default::default(),
            })?;
            println!("{token}");
        }
    }
    Ok(())
}

fn diagnostics(ctx: &BridgeContext) -> anyhow::Result<()> {
    println!("backend available: {}", ctx.backend.is_available());
    println!("current signing kid: {}", ctx.keys.current_kid());
    println!("services: {}", ctx.store().list_services()?.len());
    println!("workspaces: {}", ctx.store().list_workspaces()?.len());
    Ok(())
}

