use clap::Parser;

use eos_vbox_importer::cli::Cli;
use eos_vbox_importer::error::ImporterError;
use eos_vbox_importer::logging::LogConfig;
use eos_vbox_importer::probe;
use eos_vbox_importer::provision::{ProvisionOutcome, Provisioner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let log = LogConfig::from_env();
    let _guard = log.install();

    if !probe::is_hypervisor_installed().await {
        return Err(ImporterError::NotInstalled.into());
    }
    let api = probe::locate_control_tool().await?;

    let provisioner = Provisioner::new(api, cli.into_request(), log);
    match provisioner.run(true).await? {
        ProvisionOutcome::Provisioned(summary) => {
            tracing::debug!(
                machine = %summary.machine.name,
                replaced = summary.replaced,
                usb3 = summary.usb3_enabled,
                "provisioned"
            );
        }
        ProvisionOutcome::InvalidImage => {}
    }
    Ok(())
}
