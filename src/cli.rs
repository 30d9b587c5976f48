use clap::Parser;
use std::path::PathBuf;

use crate::provision::ProvisionRequest;

#[derive(Parser, Debug)]
#[command(
    name = "eos-vbox-importer",
    version,
    about = "Import an EOS disk image into VirtualBox as a VM with appropriate system configuration."
)]
pub struct Cli {
    /// Path to the image file to import (.vdi)
    #[arg(long)]
    pub image_path: Option<PathBuf>,

    /// Name of the virtual machine [default: Hack OS]
    #[arg(long)]
    pub machine_name: Option<String>,
}

impl Cli {
    pub fn into_request(self) -> ProvisionRequest {
        ProvisionRequest::new(self.image_path, self.machine_name)
    }
}
