//! State scripts carried by artifacts.

/// States for which artifacts may carry scripts.
pub const ARTIFACT_SCRIPT_STATES: &[&str] = &[
    "ArtifactInstall",
    "ArtifactReboot",
    "ArtifactCommit",
    "ArtifactRollback",
    "ArtifactRollbackReboot",
    "ArtifactFailure",
];

/// Actions of a state script.
pub const SCRIPT_ACTIONS: &[&str] = &["Enter", "Leave", "Error"];

/// Check whether `name` is a valid artifact state script name.
///
/// Names have the form `<State>_<Action>_<NN>[_<description>]` where `NN` are two
/// decimal digits defining the execution order.
pub fn is_valid_script_name(name: &str) -> bool {
    let mut parts = name.splitn(4, '_');
    let (Some(state), Some(action), Some(order)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let description_ok = parts.next().map_or(true, |description| !description.is_empty());
    ARTIFACT_SCRIPT_STATES.contains(&state)
        && SCRIPT_ACTIONS.contains(&action)
        && order.len() == 2
        && order.bytes().all(|byte| byte.is_ascii_digit())
        && description_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_names() {
        for name in [
            "ArtifactInstall_Enter_00",
            "ArtifactCommit_Leave_99_notify",
            "ArtifactRollbackReboot_Error_10_with_underscores",
        ] {
            assert!(is_valid_script_name(name), "{name}");
        }
        for name in [
            "ArtifactInstall_Enter",
            "ArtifactInstall_Enter_1",
            "ArtifactInstall_Enter_001",
            "ArtifactInstall_Before_00",
            "Idle_Enter_00",
            "ArtifactInstall_Enter_00_",
            "",
        ] {
            assert!(!is_valid_script_name(name), "{name}");
        }
    }
}
