use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use tracing::info;

use super::{
    CommandLine, ToolOptions, ensure_consumed, run_checked, take_bool, take_command, take_string,
};
use crate::config::ConfigKey;
use crate::pipeline::{RunContext, StageAction, StageParameters};
use crate::tools::{CommandRunner, Invocation};

const MAX_TAG_LEN: usize = 128;

/// Builds a container image and publishes `{image}` for later stages.
pub struct ImageStage {
    name: String,
    tag: String,
    context: String,
    dockerfile: Option<String>,
    build_args: BTreeMap<String, String>,
    builder: String,
    options: ToolOptions,
}

impl ImageStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let name = take_string(&mut params, "name")
            .ok_or_else(|| anyhow!("image stage requires 'name' parameter"))?;
        let tag = take_string(&mut params, "tag").unwrap_or_else(|| "{branch}-{run_id}".into());
        let context = take_string(&mut params, "context").unwrap_or_else(|| ".".into());
        let dockerfile = take_string(&mut params, "dockerfile");
        let builder = take_string(&mut params, "builder").unwrap_or_else(|| "docker".into());
        let build_args = match params.remove("build_args") {
            None => BTreeMap::new(),
            Some(serde_json::Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| {
                    let value = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                    (k, value)
                })
                .collect(),
            Some(other) => bail!("'build_args' must be a mapping, found {other}"),
        };
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("image", &params)?;
        Ok(Self {
            name,
            tag,
            context,
            dockerfile,
            build_args,
            builder,
            options,
        })
    }
}

impl StageAction for ImageStage {
    fn kind(&self) -> &'static str {
        "image"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        let name = ctx.render(&self.name)?;
        let tag = sanitize_tag(&ctx.render(&self.tag)?);
        if tag.is_empty() {
            bail!("image tag '{}' renders to an empty value", self.tag);
        }
        let reference = format!("{name}:{tag}");

        let mut args = vec!["build".to_string(), "-t".to_string(), reference.clone()];
        if let Some(dockerfile) = &self.dockerfile {
            args.extend(["-f".to_string(), ctx.render(dockerfile)?]);
        }
        for (key, value) in &self.build_args {
            args.extend(["--build-arg".to_string(), format!("{key}={}", ctx.render(value)?)]);
        }
        args.push(ctx.render(&self.context)?);

        let invocation = self.options.invocation(ctx, self.builder.clone(), args)?;
        run_checked(ctx, tools, &invocation)?;

        info!(image = %reference, "Image built");
        ctx.set_var("image_name", name);
        ctx.set_var("image_tag", tag);
        ctx.set_var("image", reference);
        Ok(())
    }
}

/// Docker tags allow `[A-Za-z0-9_.-]`, must not start with `.` or `-`, and
/// are at most 128 characters.
fn sanitize_tag(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .trim_start_matches(['.', '-'])
        .chars()
        .take(MAX_TAG_LEN)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PublishTarget {
    Docker {
        image: String,
    },
    Nexus {
        file: String,
        repository: String,
        path: Option<String>,
    },
}

/// Pushes the built image to a registry, or uploads a file to Nexus.
pub struct PublishStage {
    target: PublishTarget,
    program: Option<String>,
    options: ToolOptions,
}

impl PublishStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let target = match take_string(&mut params, "target").as_deref() {
            None | Some("docker") => PublishTarget::Docker {
                image: take_string(&mut params, "image").unwrap_or_else(|| "{image}".into()),
            },
            Some("nexus") => PublishTarget::Nexus {
                file: take_string(&mut params, "file")
                    .ok_or_else(|| anyhow!("nexus publish requires 'file' parameter"))?,
                repository: take_string(&mut params, "repository")
                    .ok_or_else(|| anyhow!("nexus publish requires 'repository' parameter"))?,
                path: take_string(&mut params, "path"),
            },
            Some(other) => bail!("Unsupported publish target '{other}' (expected docker or nexus)"),
        };
        let program = take_string(&mut params, "program");
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("publish", &params)?;
        Ok(Self {
            target,
            program,
            options,
        })
    }

    fn push_image(&self, ctx: &mut RunContext, tools: &dyn CommandRunner, image: &str) -> Result<()> {
        let credentials = ctx
            .config
            .docker_registry_credentials
            .clone()
            .ok_or_else(|| anyhow!("docker registry credentials are not configured"))?;
        let program = self.program.clone().unwrap_or_else(|| "docker".into());
        let reference = ctx.render(image)?;

        let login = self
            .options
            .invocation(
                ctx,
                program.clone(),
                vec![
                    "login".into(),
                    credentials.registry.clone(),
                    "--username".into(),
                    credentials.username.clone(),
                    "--password-stdin".into(),
                ],
            )?
            .stdin(credentials.password.clone());
        run_checked(ctx, tools, &login)?;

        let push = self
            .options
            .invocation(ctx, program, vec!["push".into(), reference.clone()])?;
        run_checked(ctx, tools, &push)?;
        info!(image = %reference, registry = %credentials.registry, "Image pushed");
        ctx.set_var("published", reference);
        Ok(())
    }

    fn upload_file(
        &self,
        ctx: &mut RunContext,
        tools: &dyn CommandRunner,
        file: &str,
        repository: &str,
        path: Option<&str>,
    ) -> Result<()> {
        let nexus_url = ctx
            .config
            .nexus_url
            .clone()
            .ok_or_else(|| anyhow!("nexus_url is not configured"))?;
        let local = ctx.resolve_path(file)?;
        if !local.is_file() {
            bail!("artifact to publish not found: {}", local.display());
        }
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("artifact path has no file name: {}", local.display()))?;
        let remote_path = match path {
            Some(path) => ctx.render(path)?,
            None => format!("{}/{}/{}", ctx.pipeline, ctx.run_id, file_name),
        };
        let url = format!(
            "{}/repository/{}/{}",
            nexus_url.trim_end_matches('/'),
            ctx.render(repository)?,
            remote_path.trim_start_matches('/')
        );

        let program = self.program.clone().unwrap_or_else(|| "curl".into());
        let upload: Invocation = self.options.invocation(
            ctx,
            program,
            vec![
                "--fail".into(),
                "--silent".into(),
                "--show-error".into(),
                "--netrc-optional".into(),
                "--upload-file".into(),
                local.to_string_lossy().into_owned(),
                url.clone(),
            ],
        )?;
        run_checked(ctx, tools, &upload)?;
        info!(url = %url, "Artifact uploaded");
        ctx.set_var("published", url);
        Ok(())
    }
}

impl StageAction for PublishStage {
    fn kind(&self) -> &'static str {
        "publish"
    }

    fn required_config(&self) -> Vec<ConfigKey> {
        match self.target {
            PublishTarget::Docker { .. } => vec![ConfigKey::DockerRegistryCredentials],
            PublishTarget::Nexus { .. } => vec![ConfigKey::NexusUrl],
        }
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        match &self.target {
            PublishTarget::Docker { image } => self.push_image(ctx, tools, image),
            PublishTarget::Nexus {
                file,
                repository,
                path,
            } => self.upload_file(ctx, tools, file, repository, path.as_deref()),
        }
    }
}

/// GitOps sync: asks the controller (Argo CD) to reconcile the application.
pub struct DeployStage {
    command: Option<CommandLine>,
    app: Option<String>,
    revision: Option<String>,
    wait: bool,
    wait_timeout: Option<String>,
    options: ToolOptions,
}

impl DeployStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_command(&mut params, "command")?;
        let app = take_string(&mut params, "app");
        if command.is_none() && app.is_none() {
            bail!("deploy stage requires 'app' or 'command' parameter");
        }
        let revision = take_string(&mut params, "revision");
        let wait = take_bool(&mut params, "wait")?.unwrap_or(true);
        let wait_timeout = take_string(&mut params, "wait_timeout");
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("deploy", &params)?;
        Ok(Self {
            command,
            app,
            revision,
            wait,
            wait_timeout,
            options,
        })
    }

    fn argocd_steps(&self, app: &str) -> Vec<CommandLine> {
        let mut sync = vec!["argocd".to_string(), "app".into(), "sync".into(), app.to_string()];
        if let Some(revision) = &self.revision {
            sync.extend(["--revision".into(), revision.clone()]);
        }
        let mut steps = vec![CommandLine::Argv(sync)];
        if self.wait {
            let mut wait = vec![
                "argocd".to_string(),
                "app".into(),
                "wait".into(),
                app.to_string(),
                "--health".into(),
            ];
            if let Some(timeout) = &self.wait_timeout {
                wait.extend(["--timeout".into(), timeout.clone()]);
            }
            steps.push(CommandLine::Argv(wait));
        }
        steps
    }
}

impl StageAction for DeployStage {
    fn kind(&self) -> &'static str {
        "deploy"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        let steps = match (&self.command, &self.app) {
            (Some(command), _) => vec![command.clone()],
            (None, Some(app)) => self.argocd_steps(app),
            (None, None) => bail!("deploy stage has nothing to run"),
        };
        for step in steps {
            let invocation = step.invocation(ctx, &self.options)?;
            run_checked(ctx, tools, &invocation)?;
        }
        if let Some(app) = &self.app {
            info!(app = %ctx.render(app)?, "Deployment synced");
        }
        Ok(())
    }
}
