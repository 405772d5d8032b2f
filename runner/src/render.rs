use crate::manifest::JobSpec;
use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};

/// Render both per-job artifacts into `dir`: the configuration payload read
/// by the workload and the submission script handed to the scheduler. The
/// job name is embedded in both file names for traceability. Returns the
/// script path, which is what the submit command wants.
pub fn write_artifacts(spec: &JobSpec, program: &str, dir: &Path) -> io::Result<PathBuf> {
    let config = dir.join(format!("{}.cfg", spec.name));
    let script = dir.join(format!("{}.pbs", spec.name));

    fs::write(&config, config_payload(spec))?;
    fs::write(&script, submit_script(spec, program, &config))?;

    Ok(script)
}

/// `key = value` lines, one per resolved parameter
pub fn config_payload(spec: &JobSpec) -> String {
    spec.params
        .iter()
        .fold(String::new(), |mut payload, (key, value)| {
            let _ = writeln!(payload, "{key} = {value}");

            payload
        })
}

pub fn submit_script(spec: &JobSpec, program: &str, config: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         #PBS -N {name}\n\
         #PBS -l nodes={nodes}:ppn={ppn}\n\
         cd \"$PBS_O_WORKDIR\"\n\
         mpirun -np {procs} {program} {config}\n",
        name = spec.name,
        nodes = spec.nodes(),
        ppn = spec.ppn(),
        procs = spec.procs(),
        program = program,
        config = config.display(),
    )
}
