use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::types::UpdateStrategy;
use crate::lib::runtime::gateway::RuntimeGateway;
use crate::lib::runtime::types::{ContainerDetails, ContainerStatus, RuntimeError, RuntimeResult};

pub const COLOR_LABEL: &str = "r_keeper.color";

/// Inputs shared by every phase of a strategy run.
pub struct StrategyContext<'a> {
    pub gateway: &'a RuntimeGateway,
    pub cancel: &'a CancellationToken,
    /// Name operators know the container by.
    pub name: &'a str,
    pub old: &'a ContainerDetails,
    pub new_image: &'a str,
    /// Image restored on rollback: a backup snapshot or the old image id.
    pub rollback_image: &'a str,
}

/// How a new image replaces a running container.
///
/// `apply` brings up the new container and returns its id. `finalize` runs
/// after verification and returns the id callers should use from then on.
/// `rollback` restores service on the old image and returns the id now
/// serving; `new_id` is `None` when `apply` failed before creating anything.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn apply(&self, ctx: &StrategyContext<'_>) -> RuntimeResult<String>;
    async fn finalize(&self, ctx: &StrategyContext<'_>, new_id: &str) -> RuntimeResult<String>;
    async fn rollback(&self, ctx: &StrategyContext<'_>, new_id: Option<&str>) -> RuntimeResult<String>;
}

pub fn strategy_for(kind: UpdateStrategy) -> Box<dyn Strategy> {
    match kind {
        UpdateStrategy::Recreate => Box::new(Recreate),
        UpdateStrategy::Rolling => Box::new(Rolling),
        UpdateStrategy::BlueGreen => Box::new(BlueGreen),
    }
}

async fn remove_if_present(ctx: &StrategyContext<'_>, id: &str) -> RuntimeResult<()> {
    match ctx.gateway.remove(ctx.cancel, id, true).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn create_and_start(ctx: &StrategyContext<'_>, name: &str, image: &str) -> RuntimeResult<String> {
    let spec = ctx.old.spec.derive(name, image);
    let id = ctx.gateway.create(ctx.cancel, &spec).await?;
    ctx.gateway.start(ctx.cancel, &id).await?;
    Ok(id)
}

/// Makes sure the untouched old container is serving again.
async fn ensure_old_running(ctx: &StrategyContext<'_>) -> RuntimeResult<String> {
    let old = ctx.gateway.inspect(ctx.cancel, &ctx.old.id).await?;
    if old.status != ContainerStatus::Running {
        ctx.gateway.start(ctx.cancel, &old.id).await?;
    }
    Ok(old.id)
}

/// Stop and remove the old container, then start the new image under the
/// same name and configuration.
pub struct Recreate;

#[async_trait]
impl Strategy for Recreate {
    async fn apply(&self, ctx: &StrategyContext<'_>) -> RuntimeResult<String> {
        ctx.gateway.stop(ctx.cancel, &ctx.old.id).await?;
        ctx.gateway.remove(ctx.cancel, &ctx.old.id, true).await?;
        create_and_start(ctx, ctx.name, ctx.new_image).await
    }

    async fn finalize(&self, _ctx: &StrategyContext<'_>, new_id: &str) -> RuntimeResult<String> {
        Ok(new_id.to_string())
    }

    async fn rollback(&self, ctx: &StrategyContext<'_>, new_id: Option<&str>) -> RuntimeResult<String> {
        // apply may have failed before the old container was removed.
        match ctx.gateway.inspect(ctx.cancel, ctx.name).await {
            Ok(current) if current.id == ctx.old.id => return ensure_old_running(ctx).await,
            Ok(current) => remove_if_present(ctx, &current.id).await?,
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(id) = new_id {
            remove_if_present(ctx, id).await?;
        }
        info!("Recreating {} from {}", ctx.name, ctx.rollback_image);
        create_and_start(ctx, ctx.name, ctx.rollback_image).await
    }
}

/// Start the new container next to the old one and swap names once it is
/// verified.
pub struct Rolling;

fn next_name(name: &str) -> String {
    format!("{}-next", name)
}

#[async_trait]
impl Strategy for Rolling {
    async fn apply(&self, ctx: &StrategyContext<'_>) -> RuntimeResult<String> {
        let name = next_name(ctx.name);
        // Leftover from an interrupted run.
        remove_if_present(ctx, &name).await?;
        create_and_start(ctx, &name, ctx.new_image).await
    }

    async fn finalize(&self, ctx: &StrategyContext<'_>, new_id: &str) -> RuntimeResult<String> {
        ctx.gateway.stop(ctx.cancel, &ctx.old.id).await?;
        ctx.gateway.remove(ctx.cancel, &ctx.old.id, true).await?;
        ctx.gateway.rename(ctx.cancel, new_id, ctx.name).await?;
        Ok(new_id.to_string())
    }

    async fn rollback(&self, ctx: &StrategyContext<'_>, new_id: Option<&str>) -> RuntimeResult<String> {
        let new_ref = new_id.map(str::to_string).unwrap_or_else(|| next_name(ctx.name));
        remove_if_present(ctx, &new_ref).await?;
        ensure_old_running(ctx).await
    }
}

/// Run a second colour of the container and cut the managed reference over
/// to it.
pub struct BlueGreen;

fn next_color(old: &ContainerDetails) -> &'static str {
    match old.spec.labels.get(COLOR_LABEL).map(String::as_str) {
        Some("blue") => "green",
        _ => "blue",
    }
}

fn colored_name(ctx: &StrategyContext<'_>) -> String {
    format!("{}-{}", ctx.name, next_color(ctx.old))
}

#[async_trait]
impl Strategy for BlueGreen {
    async fn apply(&self, ctx: &StrategyContext<'_>) -> RuntimeResult<String> {
        let name = colored_name(ctx);
        remove_if_present(ctx, &name).await?;
        let mut spec = ctx.old.spec.derive(&name, ctx.new_image);
        spec.labels
            .insert(COLOR_LABEL.to_string(), next_color(ctx.old).to_string());
        let id = ctx.gateway.create(ctx.cancel, &spec).await?;
        ctx.gateway.start(ctx.cancel, &id).await?;
        Ok(id)
    }

    async fn finalize(&self, ctx: &StrategyContext<'_>, new_id: &str) -> RuntimeResult<String> {
        if let Err(e) = ctx.gateway.stop(ctx.cancel, &ctx.old.id).await {
            warn!("Stopping old instance {} failed: {}", ctx.old.name, e);
        }
        remove_if_present(ctx, &ctx.old.id).await?;
        Ok(new_id.to_string())
    }

    async fn rollback(&self, ctx: &StrategyContext<'_>, new_id: Option<&str>) -> RuntimeResult<String> {
        let new_ref = new_id.map(str::to_string).unwrap_or_else(|| colored_name(ctx));
        remove_if_present(ctx, &new_ref).await?;
        ensure_old_running(ctx).await
    }
}
