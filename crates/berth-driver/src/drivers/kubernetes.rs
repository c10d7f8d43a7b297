//! Container-orchestration driver on the `kubectl` CLI.
//!
//! Each instance is a single pod named after the instance. The manifest is
//! piped to `kubectl apply -f -`, which is idempotent by construction.

use std::sync::Arc;
use std::time::Duration;

use berth_core::config::KubernetesSettings;
use berth_process::{CommandRunner, CommandSpec, ProcessOutput};
use serde_json::json;
use tracing::debug;

use crate::driver::{BackendStatus, Driver, DriverContext, DriverFuture, ProvisionOutcome};
use crate::error::{DriverError, DriverResult};

/// Credential scope for the optional API bearer token.
pub const CREDENTIAL_SCOPE: &str = "kubernetes";

pub struct KubernetesDriver {
    settings: KubernetesSettings,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl KubernetesDriver {
    pub fn new(
        settings: KubernetesSettings,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            settings,
            runner,
            timeout,
        }
    }

    fn namespace<'a>(&'a self, ctx: &'a DriverContext) -> &'a str {
        ctx.param("namespace").unwrap_or(&self.settings.namespace)
    }

    fn kubectl(&self, ctx: &DriverContext) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.settings.binary, self.timeout);
        if let Some(context) = &self.settings.context {
            cmd = cmd.arg("--context").arg(context);
        }
        if let Ok(token) = ctx.credentials.get_secret(CREDENTIAL_SCOPE, "token") {
            cmd = cmd.arg("--token").secret_arg(token.expose());
        }
        cmd.arg("-n").arg(self.namespace(ctx))
    }

    fn manifest(&self, ctx: &DriverContext) -> serde_json::Value {
        let mut container = json!({
            "name": "workload",
            "image": ctx.blueprint.image,
        });
        if let Some(port) = ctx.param("internal_port").and_then(|p| p.parse::<u16>().ok()) {
            container["ports"] = json!([{ "containerPort": port }]);
        }
        if let Some(memory) = ctx.param("memory_limit") {
            container["resources"] = json!({ "limits": { "memory": memory } });
        }
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": ctx.instance.name,
                "namespace": self.namespace(ctx),
                "labels": {
                    "app.kubernetes.io/managed-by": "berth",
                    "berth/instance": ctx.instance.id,
                    "berth/owner": ctx.instance.owner,
                },
            },
            "spec": {
                "restartPolicy": "Always",
                "containers": [container],
            },
        })
    }

    /// Pod phase, `None` if the pod does not exist.
    async fn phase(&self, ctx: &DriverContext, logged: bool) -> DriverResult<Option<String>> {
        let cmd = self
            .kubectl(ctx)
            .args(["get", "pod"])
            .arg(&ctx.instance.name)
            .args(["-o", "jsonpath={.status.phase}"]);
        let out = if logged {
            self.runner.run_logged(&cmd, &ctx.command_log()).await?
        } else {
            self.runner.run(&cmd).await?
        };
        if out.success() {
            return Ok(Some(out.trimmed().to_string()));
        }
        if is_missing(&out) {
            return Ok(None);
        }
        Err(classify_failure("get pod", &out))
    }

    async fn do_provision(&self, ctx: &DriverContext) -> DriverResult<ProvisionOutcome> {
        let name = &ctx.instance.name;
        match self.phase(ctx, true).await? {
            Some(phase) if is_finished(&phase) => {
                ctx.log
                    .warn(&format!("pod {name} left over in phase {phase}, replacing it"));
                self.delete_pod(ctx, true).await?;
                self.apply(ctx).await?;
            }
            Some(phase) => {
                ctx.log
                    .info(&format!("pod {name} already exists in phase {phase}, adopting it"));
            }
            None => self.apply(ctx).await?,
        }
        Ok(ProvisionOutcome::default()
            .with("pod", name.clone())
            .with("namespace", self.namespace(ctx)))
    }

    async fn apply(&self, ctx: &DriverContext) -> DriverResult<()> {
        let manifest = serde_json::to_vec(&self.manifest(ctx))
            .map_err(|e| DriverError::Permanent(format!("cannot render pod manifest: {e}")))?;
        let cmd = self.kubectl(ctx).args(["apply", "-f", "-"]).stdin(manifest);
        let out = self.runner.run_logged(&cmd, &ctx.command_log()).await?;
        if !out.success() {
            return Err(classify_failure("apply", &out));
        }
        debug!(instance_id = %ctx.instance.id, pod = %ctx.instance.name, "pod applied");
        Ok(())
    }

    /// Delete the instance pod. `wait` blocks until the name is free again.
    async fn delete_pod(&self, ctx: &DriverContext, wait: bool) -> DriverResult<()> {
        let cmd = self
            .kubectl(ctx)
            .args(["delete", "pod"])
            .arg(&ctx.instance.name)
            .arg("--ignore-not-found")
            .arg(if wait { "--wait=true" } else { "--wait=false" });
        let out = self.runner.run_logged(&cmd, &ctx.command_log()).await?;
        if out.success() || is_missing(&out) {
            return Ok(());
        }
        Err(classify_failure("delete pod", &out))
    }

    async fn do_deprovision(&self, ctx: &DriverContext) -> DriverResult<()> {
        self.delete_pod(ctx, false).await
    }

    async fn do_query_status(&self, ctx: &DriverContext) -> DriverResult<BackendStatus> {
        match self.phase(ctx, false).await {
            Ok(None) => Ok(BackendStatus::NotFound),
            Ok(Some(phase)) => Ok(match phase.as_str() {
                "Running" => BackendStatus::Running,
                "Pending" | "" => BackendStatus::Pending,
                _ => BackendStatus::Unreachable,
            }),
            Err(err) if err.is_retryable() => Ok(BackendStatus::Unreachable),
            Err(err) => Err(err),
        }
    }
}

/// Phases a pod with `restartPolicy: Always` never leaves.
fn is_finished(phase: &str) -> bool {
    matches!(phase, "Failed" | "Succeeded")
}

fn is_missing(out: &ProcessOutput) -> bool {
    out.output.contains("NotFound") || out.output.contains("not found")
}

fn classify_failure(what: &str, out: &ProcessOutput) -> DriverError {
    let text = out.trimmed();
    let message = format!("kubectl {what} exited with {:?}: {text}", out.exit_code);
    let permanent = ["Forbidden", "Unauthorized", "is invalid", "exceeded quota", "admission webhook"];
    if permanent.iter().any(|p| text.contains(p)) {
        DriverError::Permanent(message)
    } else {
        DriverError::Transient(message)
    }
}

impl Driver for KubernetesDriver {
    fn name(&self) -> &'static str {
        "kubernetes"
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
