use std::path::Path;

use tracing::{info, instrument};
use v4l::capability::Flags;
use v4l::Device;

use crate::error::{Result, SetupError};

/// What a video node reported about itself.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub driver: String,
    pub card: String,
    pub capabilities: Flags,
}

/// Query a video node's capabilities and check it can stream, optionally
/// also that it carries `required`.
#[instrument]
pub fn probe_node(path: &str, required: Option<(Flags, &'static str)>) -> Result<NodeInfo> {
    if !Path::new(path).exists() {
        return Err(SetupError::Capability {
            node: path.to_owned(),
            missing: "device node",
        }
        .into());
    }

    let caps = Device::with_path(path)?.query_caps()?;
    let flags = caps.capabilities;
    check(path, flags, Flags::STREAMING, "streaming I/O")?;
    if let Some((flag, name)) = required {
        check(path, flags, flag, name)?;
    }

    info!(node = path, card = %caps.card, driver = %caps.driver, "Probed device");
    Ok(NodeInfo {
        driver: caps.driver,
        card: caps.card,
        capabilities: flags,
    })
}

fn check(path: &str, flags: Flags, flag: Flags, missing: &'static str) -> Result<()> {
    if flags.contains(flag) {
        Ok(())
    } else {
        Err(SetupError::Capability {
            node: path.to_owned(),
            missing,
        }
        .into())
    }
}
