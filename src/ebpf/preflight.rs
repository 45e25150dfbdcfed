//! Capability preflight
//!
//! Checks the effective capability set before anything is loaded, so a
//! missing privilege produces one clear diagnostic instead of an opaque
//! EPERM from the BPF syscall.

use caps::{CapSet, Capability};

use super::FilterError;

/// Capabilities the filter needs, with the alternatives that also satisfy each need.
///
/// CAP_BPF and CAP_PERFMON were split out of CAP_SYS_ADMIN in Linux 5.8;
/// older kernels need CAP_SYS_ADMIN for both.
const REQUIREMENTS: &[(&str, &[Capability])] = &[
    ("load BPF programs", &[Capability::CAP_BPF, Capability::CAP_SYS_ADMIN]),
    ("attach kprobes", &[Capability::CAP_PERFMON, Capability::CAP_SYS_ADMIN]),
    ("destroy sockets", &[Capability::CAP_NET_ADMIN]),
];

/// Return the needs that no held capability satisfies.
pub fn missing_requirements(held: &[Capability]) -> Vec<&'static str> {
    REQUIREMENTS
        .iter()
        .filter(|(_, any_of)| !any_of.iter().any(|cap| held.contains(cap)))
        .map(|(need, _)| *need)
        .collect()
}

/// Verify the current process can load, attach and enforce.
pub fn check() -> Result<(), FilterError> {
    let effective = caps::read(None, CapSet::Effective)
        .map_err(|e| FilterError::Preflight(format!("unable to read capabilities: {}", e)))?;
    let held: Vec<Capability> = effective.into_iter().collect();

    let missing = missing_requirements(&held);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FilterError::Preflight(format!(
            "missing privileges to {} (run as root or grant CAP_BPF, CAP_PERFMON, CAP_NET_ADMIN)",
            missing.join(", ")
        )))
    }
}
