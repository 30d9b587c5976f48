use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ImporterError {
    #[error("VirtualBox is not installed.")]
    #[diagnostic(help("install VirtualBox from https://www.virtualbox.org/wiki/Downloads"))]
    NotInstalled,

    #[error("VirtualBox automation API (VBoxManage) is not available.")]
    #[diagnostic(help("{hint}"))]
    AutomationUnavailable { hint: String },

    #[error("machine '{name}' already exists")]
    #[diagnostic(help("remove the existing machine or run with destroy_existing enabled"))]
    MachineExists { name: String },

    #[error("failed to create machine '{name}'")]
    CreateMachine {
        name: String,
        #[source]
        source: Box<ImporterError>,
    },

    #[error("unknown {category} constant '{symbol}'")]
    UnknownConstant { category: String, symbol: String },

    #[error("{operation} failed: {message}")]
    ControlApi { operation: String, message: String },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("unexpected output from {command}: {message}")]
    Parse { command: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ImporterError {
    pub(crate) fn control_api(operation: &str, message: impl Into<String>) -> Self {
        ImporterError::ControlApi {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}
