//! Virtualization-cluster driver and pool host provider on the `openstack`
//! CLI.
//!
//! Servers are addressed by name, so both the instance driver and the host
//! provider can look up what an earlier, interrupted call created. CLI
//! credentials come from the `openstack` scope of the credential store and
//! are passed through the child environment, never on the command line.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::config::OpenStackSettings;
use berth_process::{CommandRunner, CommandSink, CommandSpec, ProcessOutput};
use berth_state::Host;
use serde::Deserialize;
use tracing::{debug, info};

use crate::credentials::CredentialStore;
use crate::driver::{
    BackendStatus, CommandLog, Driver, DriverContext, DriverFuture, NullLogSink,
    ProvisionOutcome, ReconfigureParams,
};
use crate::error::{DriverError, DriverResult};
use crate::host::{HostProvider, HostSpec, ProvisionedHost};

/// Credential scope holding `OS_*` variables.
pub const CREDENTIAL_SCOPE: &str = "openstack";

const REQUIRED_ENV: [&str; 4] = ["OS_AUTH_URL", "OS_USERNAME", "OS_PASSWORD", "OS_PROJECT_NAME"];
const OPTIONAL_ENV: [&str; 3] = ["OS_USER_DOMAIN_NAME", "OS_PROJECT_DOMAIN_NAME", "OS_REGION_NAME"];

/// Shared plumbing of the driver and the host provider.
struct OpenStackCli {
    settings: OpenStackSettings,
    runner: Arc<dyn CommandRunner>,
    credentials: Arc<dyn CredentialStore>,
    timeout: Duration,
}

/// Subset of `openstack server show -f json`.
#[derive(Debug, Deserialize)]
struct ServerView {
    id: String,
    status: String,
    #[serde(default)]
    addresses: serde_json::Value,
}

impl OpenStackCli {
    fn command(&self) -> DriverResult<CommandSpec> {
        let mut cmd = CommandSpec::new(&self.settings.binary, self.timeout);
        for key in REQUIRED_ENV {
            let secret = self.credentials.get_secret(CREDENTIAL_SCOPE, key)?;
            cmd = cmd.env(key, secret.expose());
        }
        for key in OPTIONAL_ENV {
            if let Ok(secret) = self.credentials.get_secret(CREDENTIAL_SCOPE, key) {
                cmd = cmd.env(key, secret.expose());
            }
        }
        Ok(cmd)
    }

    async fn run(&self, cmd: CommandSpec, sink: &dyn CommandSink) -> DriverResult<ProcessOutput> {
        Ok(self.runner.run_logged(&cmd, sink).await?)
    }

    async fn show(&self, name: &str, sink: &dyn CommandSink) -> DriverResult<Option<ServerView>> {
        let cmd = self.command()?.args(["server", "show", "-f", "json"]).arg(name);
        let out = self.run(cmd, sink).await?;
        if !out.success() {
            if is_missing(&out) {
                return Ok(None);
            }
            return Err(classify_failure("server show", &out));
        }
        parse_server(&out).map(Some)
    }

    async fn create(
        &self,
        name: &str,
        flavor: &str,
        image: &str,
        security_group: Option<&str>,
        sink: &dyn CommandSink,
    ) -> DriverResult<ServerView> {
        let mut cmd = self
            .command()?
            .args(["server", "create", "--flavor", flavor, "--image", image]);
        if let Some(network) = &self.settings.network {
            cmd = cmd.arg("--network").arg(network);
        }
        if let Some(group) = security_group {
            cmd = cmd.arg("--security-group").arg(group);
        }
        cmd = cmd.args(["--wait", "-f", "json"]).arg(name);
        let out = self.run(cmd, sink).await?;
        if !out.success() {
            return Err(classify_failure("server create", &out));
        }
        parse_server(&out)
    }

    async fn delete(&self, name: &str, sink: &dyn CommandSink) -> DriverResult<()> {
        let cmd = self.command()?.args(["server", "delete", "--wait"]).arg(name);
        let out = self.run(cmd, sink).await?;
        if out.success() || is_missing(&out) {
            return Ok(());
        }
        Err(classify_failure("server delete", &out))
    }

    async fn simple(&self, verb: &str, name: &str, sink: &dyn CommandSink) -> DriverResult<()> {
        let cmd = self
            .command()?
            .arg("server")
            .args(verb.split_whitespace())
            .arg(name);
        let out = self.run(cmd, sink).await?;
        if out.success() {
            return Ok(());
        }
        Err(classify_failure(&format!("server {verb}"), &out))
    }
}

fn parse_server(out: &ProcessOutput) -> DriverResult<ServerView> {
    serde_json::from_str(out.trimmed()).map_err(|e| {
        DriverError::InconsistentState(format!("unparseable server description: {e}"))
    })
}

/// First IP in the `addresses` field, which the CLI renders either as
/// `"net=10.0.0.5, 192.0.2.7"` or as `{"net": ["10.0.0.5"]}`.
fn first_address(addresses: &serde_json::Value) -> Option<String> {
    match addresses {
        serde_json::Value::String(s) => s
            .split([';', ','])
            .next()
            .map(|part| part.rsplit('=').next().unwrap_or(part).trim().to_string())
            .filter(|ip| !ip.is_empty()),
        serde_json::Value::Object(map) => map
            .values()
            .filter_map(|v| v.as_array())
            .flatten()
            .filter_map(|v| v.as_str())
            .next()
            .map(str::to_string),
        _ => None,
    }
}

fn is_missing(out: &ProcessOutput) -> bool {
    out.output.contains("No server with a name or ID") || out.output.contains("could not be found")
}

fn classify_failure(what: &str, out: &ProcessOutput) -> DriverError {
    let text = out.trimmed();
    let message = format!("openstack {what} exited with {:?}: {text}", out.exit_code);
    let permanent = [
        "Quota exceeded",
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "BadRequest",
        "No Flavor found",
        "No Image found",
        "No flavor with a name or ID",
        "No image with a name or ID",
    ];
    if permanent.iter().any(|p| text.contains(p)) {
        DriverError::Permanent(message)
    } else {
        DriverError::Transient(message)
    }
}

/// Servers that will never become usable again and must be recreated.
fn is_dead(status: &str) -> bool {
    matches!(status, "ERROR" | "DELETED" | "SOFT_DELETED")
}

fn server_status(status: &str) -> BackendStatus {
    match status {
        "ACTIVE" => BackendStatus::Running,
        "BUILD" | "REBUILD" | "RESIZE" | "VERIFY_RESIZE" | "REBOOT" | "HARD_REBOOT" => {
            BackendStatus::Pending
        }
        _ => BackendStatus::Unreachable,
    }
}

// ── Instance driver ───────────────────────────────────────────────

/// One virtual machine per instance.
pub struct OpenStackDriver {
    cli: OpenStackCli,
}

impl OpenStackDriver {
    pub fn new(
        settings: OpenStackSettings,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            cli: OpenStackCli {
                settings,
                runner,
                credentials,
                timeout,
            },
        }
    }

    async fn do_provision(&self, ctx: &DriverContext) -> DriverResult<ProvisionOutcome> {
        let log = ctx.command_log();
        let name = &ctx.instance.name;
        let mut existing = self.cli.show(name, &log).await?;
        if let Some(dead) = existing.take_if(|server| is_dead(&server.status)) {
            ctx.log.warn(&format!(
                "server {name} left over in status {}, replacing it",
                dead.status
            ));
            self.cli.delete(name, &log).await?;
        }
        let server = match existing {
            Some(existing) => {
                ctx.log
                    .info(&format!("server {name} already exists, adopting it"));
                existing
            }
            None => {
                let flavor = ctx.param("flavor").ok_or_else(|| {
                    DriverError::Permanent(format!(
                        "blueprint {} has no flavor parameter",
                        ctx.blueprint.id
                    ))
                })?;
                let group = ctx.param("security_group");
                self.cli
                    .create(name, flavor, &ctx.blueprint.image, group, &log)
                    .await?
            }
        };

        match server_status(&server.status) {
            BackendStatus::Unreachable => {
                return Err(DriverError::Transient(format!(
                    "server {name} is in status {}",
                    server.status
                )));
            }
            status => debug!(instance_id = %ctx.instance.id, ?status, "server provisioned"),
        }

        let mut outcome = ProvisionOutcome::default().with("server_id", server.id);
        if let Some(ip) = first_address(&server.addresses) {
            outcome = outcome.with("address", ip);
        }
        Ok(outcome)
    }

    async fn do_query_status(&self, ctx: &DriverContext) -> DriverResult<BackendStatus> {
        // Probes are not written to the instance log.
        let quiet = CommandLog(&NullLogSink);
        match self.cli.show(&ctx.instance.name, &quiet).await {
            Ok(Some(server)) => Ok(server_status(&server.status)),
            Ok(None) => Ok(BackendStatus::NotFound),
            Err(err) if err.is_retryable() => Ok(BackendStatus::Unreachable),
            Err(err) => Err(err),
        }
    }

    async fn do_reconfigure(
        &self,
        ctx: &DriverContext,
        params: &ReconfigureParams,
    ) -> DriverResult<ProvisionOutcome> {
        let Some(flavor) = params.get("flavor") else {
            return Err(DriverError::Unsupported(
                "openstack driver can only change the flavor".to_string(),
            ));
        };
        let log = ctx.command_log();
        let name = &ctx.instance.name;
        let resize = self
            .cli
            .command()?
            .args(["server", "resize", "--flavor", flavor.as_str(), "--wait"])
            .arg(name);
        let out = self.cli.run(resize, &log).await?;
        if !out.success() {
            return Err(classify_failure("server resize", &out));
        }
        self.cli.simple("resize confirm", name, &log).await?;
        ctx.log.info(&format!("server {name} resized to {flavor}"));
        Ok(ProvisionOutcome::default().with("flavor", flavor.clone()))
    }
}

impl Driver for OpenStackDriver {
    fn name(&self) -> &'static str {
        "openstack"
    }

    fn provision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ProvisionOutcome> {
        Box::pin(self.do_provision(ctx))
    }

    fn deprovision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let log = ctx.command_log();
            self.cli.delete(&ctx.instance.name, &log).await
        })
    }

    fn query_status<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, BackendStatus> {
        Box::pin(self.do_query_status(ctx))
    }

    fn reconfigure<'a>(
        &'a self,
        ctx: &'a DriverContext,
        params: &'a ReconfigureParams,
    ) -> DriverFuture<'a, ProvisionOutcome> {
        Box::pin(self.do_reconfigure(ctx, params))
    }
}

// ── Pool host provider ────────────────────────────────────────────

/// Creates docker pool hosts as servers and prepares them with a script.
pub struct OpenStackHostProvider {
    cli: OpenStackCli,
}

impl OpenStackHostProvider {
    pub fn new(
        settings: OpenStackSettings,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            cli: OpenStackCli {
                settings,
                runner,
                credentials,
                timeout,
            },
        }
    }

    async fn do_create(&self, spec: &HostSpec) -> DriverResult<ProvisionedHost> {
        let quiet = CommandLog(&NullLogSink);
        let mut existing = self.cli.show(&spec.name, &quiet).await?;
        if let Some(dead) = existing.take_if(|server| is_dead(&server.status)) {
            info!(host = %spec.name, status = %dead.status, "replacing dead pool server");
            self.cli.delete(&spec.name, &quiet).await?;
        }
        let server = match existing {
            Some(existing) => existing,
            None => {
                let group = self.cli.settings.host_security_group.clone();
                self.cli
                    .create(&spec.name, &spec.flavor, &spec.image, Some(group.as_str()), &quiet)
                    .await?
            }
        };
        info!(host = %spec.name, server_id = %server.id, "pool host created");
        Ok(ProvisionedHost {
            address: first_address(&server.addresses),
            metadata: BTreeMap::from([("server_id".to_string(), server.id)]),
        })
    }

    async fn do_prepare(&self, host: &Host) -> DriverResult<()> {
        let Some(script) = &self.cli.settings.host_prepare_script else {
            return Ok(());
        };
        let address = host.address.as_deref().ok_or_else(|| {
            DriverError::Transient(format!("host {} has no address yet", host.id))
        })?;
        let cmd = CommandSpec::new("sh", self.cli.timeout)
            .arg(script.display().to_string())
            .arg(address)
            .arg(&host.name);
        let out = self.cli.run(cmd, &CommandLog(&NullLogSink)).await?;
        if out.success() {
            return Ok(());
        }
        Err(DriverError::Transient(format!(
            "prepare script for {} exited with {:?}: {}",
            host.name,
            out.exit_code,
            out.trimmed()
        )))
    }
}

impl HostProvider for OpenStackHostProvider {
    fn create_host<'a>(&'a self, spec: &'a HostSpec) -> DriverFuture<'a, ProvisionedHost> {
        Box::pin(self.do_create(spec))
    }

    fn prepare_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(self.do_prepare(host))
    }

    fn start_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.cli
                .simple("start", &host.name, &CommandLog(&NullLogSink))
                .await
        })
    }

    fn stop_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.cli
                .simple("stop", &host.name, &CommandLog(&NullLogSink))
                .await
        })
    }

    fn destroy_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.cli.delete(&host.name, &CommandLog(&NullLogSink)).await })
    }
}
