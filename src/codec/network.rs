// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Network boot string syntax shared by every preboot environment.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use super::{BootTarget, Interpretation, NetBootProtocol};

/// Format `<protocol>://<interface>@<host>[/<path>]`.
#[must_use]
pub fn format(protocol: NetBootProtocol, interface: &str, host: &str, path: Option<&str>) -> String {
    let mut out = format!("{}://{interface}@{host}", protocol.token());
    if let Some(path) = path {
        if !path.starts_with('/') {
            out.push('/');
        }
        out.push_str(path);
    }
    out
}

/// Decode a network boot string.
pub fn decode(boot_string: &str) -> Option<Interpretation> {
    let (scheme, rest) = boot_string.split_once("://")?;
    let protocol = NetBootProtocol::from_token(scheme)?;
    let (interface, rest) = rest.split_once('@')?;
    let (host, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], Some(rest[slash..].to_owned())),
        None => (rest, None),
    };
    if interface.is_empty() || host.is_empty() {
        return None;
    }
    Some(Interpretation::Network {
        protocol,
        interface: interface.to_owned(),
        host: host.to_owned(),
        path,
    })
}

/// Parse a network boot string straight into a target.
pub fn parse_target(boot_string: &str) -> Option<BootTarget> {
    match decode(boot_string)? {
        Interpretation::Network {
            protocol,
            interface,
            host,
            path,
        } => Some(BootTarget::Network {
            protocol,
            interface,
            host,
            path,
        }),
        Interpretation::Disk { .. } | Interpretation::Legacy { .. } => None,
    }
}
