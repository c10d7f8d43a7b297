//! Container driver for pool hosts running a docker daemon.
//!
//! Each instance is one container named after the instance, started on the
//! pool host the lifecycle engine reserved a slot on. Container names make
//! provisioning idempotent: a retry inspects the name first and adopts a
//! container an earlier attempt left behind.

use std::sync::Arc;
use std::time::Duration;

use berth_core::config::DockerSettings;
use berth_process::{CommandRunner, CommandSpec, ProcessOutput};
use tracing::debug;

use crate::driver::{BackendStatus, Driver, DriverContext, DriverFuture, ProvisionOutcome};
use crate::error::{DriverError, DriverResult};

pub struct DockerDriver {
    settings: DockerSettings,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl DockerDriver {
    pub fn new(settings: DockerSettings, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            settings,
            runner,
            timeout,
        }
    }

    fn daemon_url(&self, ctx: &DriverContext) -> DriverResult<String> {
        let host = ctx.host.as_ref().ok_or_else(|| {
            DriverError::InconsistentState(format!(
                "instance {} has no pool host assigned",
                ctx.instance.id
            ))
        })?;
        let address = host.address.as_deref().ok_or_else(|| {
            DriverError::Transient(format!("host {} has no address yet", host.id))
        })?;
        Ok(format!("tcp://{address}:{}", self.settings.daemon_port))
    }

    fn docker(&self, daemon: &str) -> CommandSpec {
        CommandSpec::new(&self.settings.binary, self.timeout).args(["-H", daemon])
    }

    async fn run(&self, ctx: &DriverContext, cmd: CommandSpec) -> DriverResult<ProcessOutput> {
        let log = ctx.command_log();
        Ok(self.runner.run_logged(&cmd, &log).await?)
    }

    /// Container state by name, `None` if no such container exists.
    async fn inspect(&self, ctx: &DriverContext, daemon: &str) -> DriverResult<Option<String>> {
        let cmd = self
            .docker(daemon)
            .args(["inspect", "--format", "{{.State.Status}}"])
            .arg(&ctx.instance.name);
        let out = self.run(ctx, cmd).await?;
        if out.success() {
            return Ok(Some(out.trimmed().to_string()));
        }
        if is_missing(&out) {
            return Ok(None);
        }
        Err(classify_failure("docker inspect", &out))
    }

    async fn published_port(
        &self,
        ctx: &DriverContext,
        daemon: &str,
        internal_port: &str,
    ) -> DriverResult<Option<String>> {
        let cmd = self
            .docker(daemon)
            .arg("port")
            .arg(&ctx.instance.name)
            .arg(internal_port);
        let out = self.run(ctx, cmd).await?;
        if !out.success() {
            return Err(classify_failure("docker port", &out));
        }
        // "0.0.0.0:32768" possibly followed by an IPv6 line.
        Ok(out
            .trimmed()
            .lines()
            .next()
            .and_then(|line| line.rsplit_once(':'))
            .map(|(_, port)| port.to_string()))
    }

    async fn do_provision(&self, ctx: &DriverContext) -> DriverResult<ProvisionOutcome> {
        let daemon = self.daemon_url(ctx)?;
        let name = &ctx.instance.name;

        match self.inspect(ctx, &daemon).await?.as_deref() {
            Some("running") => {
                ctx.log.info(&format!("reusing running container {name}"));
            }
            Some(state) => {
                ctx.log
                    .info(&format!("container {name} exists in state {state}, starting it"));
                let out = self.run(ctx, self.docker(&daemon).arg("start").arg(name)).await?;
                if !out.success() {
                    return Err(classify_failure("docker start", &out));
                }
            }
            None => {
                let mut cmd = self
                    .docker(&daemon)
                    .args(["run", "-d", "--name"])
                    .arg(name)
                    .arg("--label")
                    .arg(format!("berth.instance={}", ctx.instance.id));
                if let Some(memory) = ctx.param("memory_limit") {
                    cmd = cmd.arg("--memory").arg(memory);
                }
                if let Some(port) = ctx.param("internal_port") {
                    cmd = cmd.arg("--expose").arg(port).arg("--publish-all");
                }
                cmd = cmd.arg(&ctx.blueprint.image);
                let out = self.run(ctx, cmd).await?;
                if !out.success() {
                    return Err(classify_failure("docker run", &out));
                }
                debug!(instance_id = %ctx.instance.id, container = %name, "container started");
            }
        }

        let mut outcome = ProvisionOutcome::default().with("container", name.clone());
        if let Some(address) = ctx.host.as_ref().and_then(|h| h.address.clone()) {
            outcome = outcome.with("address", address);
        }
        if let Some(internal) = ctx.param("internal_port")
            && let Some(port) = self.published_port(ctx, &daemon, internal).await?
        {
            outcome = outcome.with("port", port);
        }
        Ok(outcome)
    }

    async fn do_deprovision(&self, ctx: &DriverContext) -> DriverResult<()> {
        // No host means the container was never started.
        if ctx.host.is_none() {
            return Ok(());
        }
        let daemon = self.daemon_url(ctx)?;
        let cmd = self
            .docker(&daemon)
            .args(["rm", "-f"])
            .arg(&ctx.instance.name);
        let out = self.run(ctx, cmd).await?;
        if out.success() || is_missing(&out) {
            return Ok(());
        }
        Err(classify_failure("docker rm", &out))
    }

    async fn do_query_status(&self, ctx: &DriverContext) -> DriverResult<BackendStatus> {
        if ctx.host.is_none() {
            return Ok(BackendStatus::NotFound);
        }
        let daemon = self.daemon_url(ctx)?;
        let cmd = self
            .docker(&daemon)
            .args(["inspect", "--format", "{{.State.Status}}"])
            .arg(&ctx.instance.name);
        // Probes are not audited; they run every health interval.
        let out = match self.runner.run(&cmd).await {
            Ok(out) => out,
            Err(_) => return Ok(BackendStatus::Unreachable),
        };
        if !out.success() {
            return Ok(if is_missing(&out) {
                BackendStatus::NotFound
            } else {
                BackendStatus::Unreachable
            });
        }
        Ok(match out.trimmed() {
            "running" => BackendStatus::Running,
            "created" | "restarting" => BackendStatus::Pending,
            _ => BackendStatus::Unreachable,
        })
    }
}

fn is_missing(out: &ProcessOutput) -> bool {
    out.output.contains("No such container") || out.output.contains("No such object")
}

/// Map a failed docker invocation onto the driver taxonomy.
fn classify_failure(what: &str, out: &ProcessOutput) -> DriverError {
    let text = out.trimmed();
    let message = format!("{what} exited with {:?}: {text}", out.exit_code);
    let permanent = [
        "No such image",
        "pull access denied",
        "manifest unknown",
        "invalid reference format",
        "Conflict. The container name",
    ];
    if permanent.iter().any(|p| text.contains(p)) {
        DriverError::Permanent(message)
    } else {
        DriverError::Transient(message)
    }
}

impl Driver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn uses_host_pool(&self) -> bool {
        true
    }

    fn provision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ProvisionOutcome> {
        Box::pin(self.do_provision(ctx))
    }

    fn deprovision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ()> {
        Box::pin(self.do_deprovision(ctx))
    }

    fn query_status<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, BackendStatus> {
        Box::pin(self.do_query_status(ctx))
    }
}
