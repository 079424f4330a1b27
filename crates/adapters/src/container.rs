//! Payload container wrapping: the Yoda/AthenaMP command line is run
//! inside a Singularity container when the site requires it (spec.md
//! §6, `use_container`). Pure command-building, no state to fake,
//! grounded on the teacher's `core::container::ContainerConfig` and the
//! Docker adapter's command-argument style.

use std::path::PathBuf;

/// Container configuration carried through the Lifecycle's payload-
/// command preparation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub workdir_bind: PathBuf,
    pub extra_binds: Vec<PathBuf>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, workdir_bind: impl Into<PathBuf>) -> Self {
        Self { image: image.into(), workdir_bind: workdir_bind.into(), extra_binds: Vec::new() }
    }

    pub fn with_bind(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_binds.push(path.into());
        self
    }
}

/// Build the `singularity exec` argument vector wrapping `payload_command`.
/// The workdir is bound read-write at the same path inside the
/// container so the payload's relative paths keep working unchanged.
pub fn build_singularity_command(spec: &ContainerSpec, payload_command: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    for bind in std::iter::once(&spec.workdir_bind).chain(spec.extra_binds.iter()) {
        args.push("--bind".to_string());
        args.push(format!("{0}:{0}", bind.display()));
    }
    args.push("--pwd".to_string());
    args.push(spec.workdir_bind.display().to_string());
    args.push(spec.image.clone());
    args.push("/bin/sh".to_string());
    args.push("-c".to_string());
    args.push(payload_command.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_payload_command_with_bound_workdir() {
        let spec = ContainerSpec::new("hpc:yoda", "/work/job-0001");
        let args = build_singularity_command(&spec, "athena.py --events 1000");
        assert_eq!(args[0], "exec");
        assert!(args.contains(&"--bind".to_string()));
        assert!(args.contains(&"/work/job-0001:/work/job-0001".to_string()));
        assert_eq!(args.last().unwrap(), "athena.py --events 1000");
    }

    #[test]
    fn includes_extra_binds() {
        let spec = ContainerSpec::new("hpc:yoda", "/work/job-0001")
            .with_bind("/cvmfs/atlas.cern.ch");
        let args = build_singularity_command(&spec, "athena.py");
        assert!(args.contains(&"/cvmfs/atlas.cern.ch:/cvmfs/atlas.cern.ch".to_string()));
    }
}
