use crate::conf::Interface;
use anyhow::Context;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Hook {
    PreUp,
    PostUp,
    PreDown,
    PostDown,
}

impl Hook {
    pub fn command(self, interface: &Interface) -> Option<&str> {
        match self {
            Hook::PreUp => interface.pre_up.as_deref(),
            Hook::PostUp => interface.post_up.as_deref(),
            Hook::PreDown => interface.pre_down.as_deref(),
            Hook::PostDown => interface.post_down.as_deref(),
        }
    }
}

fn shell(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut shell = Command::new("cmd");
        shell.arg("/d").arg("/c").arg(command);
        shell
    }
    #[cfg(not(windows))]
    {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command);
        shell
    }
}

/// Runs the hook's command, if any, with `%i` replaced by the interface
/// name. A non-zero exit is an error.
pub async fn run_hook(hook: Hook, interface: &Interface, interface_name: &str) -> anyhow::Result<()> {
    let Some(command) = hook.command(interface) else {
        return Ok(());
    };
    let command = command.replace("%i", interface_name);
    tracing::info!("Executing {}: {}", hook, command);

    let output = shell(&command)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {} command", hook))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        tracing::info!("{}: {}", hook, line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::warn!("{}: {}", hook, line);
    }

    anyhow::ensure!(
        output.status.success(),
        "{} command exited with {}",
        hook,
        output.status
    );
    Ok(())
}
