use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use clap::Parser;

use crate::cgroup::CgroupController;
use crate::limits::Limits;

/// The private sentinel flags that mark a process as a re-exec of the
/// server rather than a user-facing invocation. Users must not collide
/// with these; the `--` separator in the wrapped argument vector keeps
/// user arguments out of this parse entirely.
const JOBID_FLAG: &str = "--jobid";
const COMMAND_FLAG: &str = "--command";

/// Flag set of the trampoline invocation, produced by
/// `Job::wrap_args` on the serving side.
#[derive(Debug, Parser)]
#[command(name = "jobworker-wrapped", disable_help_flag = true, disable_version_flag = true)]
pub struct ReexecArgs {
    #[arg(long)]
    pub jobid: String,

    #[arg(long)]
    pub command: String,

    #[arg(long, default_value_t = 0)]
    pub memorymb: u32,

    #[arg(long, default_value_t = 0)]
    pub cpuweight: u32,

    #[arg(long, default_value_t = 0)]
    pub ioweight: u32,

    /// Alternate cgroup hierarchy root, set by the spawner when it was
    /// configured with one.
    #[arg(long)]
    pub cgroup_root: Option<PathBuf>,

    /// The user command's own arguments, after the `--` separator.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl ReexecArgs {
    pub fn limits(&self) -> Limits {
        Limits {
            memory_mb: self.memorymb,
            cpu_weight: self.cpuweight,
            io_weight: self.ioweight,
        }
    }
}

/// Whether this invocation is a re-exec. Both sentinels must be present;
/// anything less falls through to the normal CLI.
pub fn is_reexec() -> bool {
    has_sentinels(std::env::args())
}

fn has_sentinels<I>(args: I) -> bool
where
    I: IntoIterator<Item = String>,
{
    let (mut jobid, mut command) = (false, false);
    for arg in args {
        // Stop at the separator: everything after it belongs to the user
        // command.
        if arg == "--" {
            break;
        }
        if arg == JOBID_FLAG || arg.starts_with("--jobid=") {
            jobid = true;
        }
        if arg == COMMAND_FLAG || arg.starts_with("--command=") {
            command = true;
        }
    }
    jobid && command
}

/// Trampoline mode: enrol our own pid into the job's cgroup, then replace
/// this process with the user command. Never returns: on success the exec
/// hands the process — limits already applied, pipes and exit-code slot
/// intact — to the user command; on failure the process exits.
pub async fn run() {
    let args = ReexecArgs::parse();

    let controller = match &args.cgroup_root {
        Some(root) => CgroupController::with_root(root),
        None => CgroupController::new(),
    };

    let pid = std::process::id();
    let limits = args.limits().to_cgroup_limits();
    if let Err(e) = controller.put(&args.jobid, pid, &limits).await {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let err = std::process::Command::new(&args.command)
        .args(&args.args)
        .exec();
    eprintln!("failed to exec {}: {err}", args.command);
    std::process::exit(127);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sentinel_detection_requires_both_flags() {
        assert!(has_sentinels(strings(&[
            "jobworker",
            "--jobid=abc",
            "--command=echo",
            "--",
            "hi"
        ])));
        assert!(!has_sentinels(strings(&["jobworker", "--jobid=abc"])));
        assert!(!has_sentinels(strings(&["jobworker", "--command=echo"])));
        assert!(!has_sentinels(strings(&["jobworker", "serve"])));
    }

    #[test]
    fn sentinels_after_the_separator_do_not_count() {
        assert!(!has_sentinels(strings(&[
            "jobworker",
            "start",
            "--",
            "--jobid=abc",
            "--command=echo"
        ])));
    }

    #[test]
    fn limit_flags_round_trip_through_the_parser() {
        let limits = Limits {
            memory_mb: 64,
            cpu_weight: 30,
            io_weight: 15,
        };

        let mut argv = vec!["jobworker".to_string()];
        argv.extend(limits.to_flags());
        argv.push("--jobid=00000000-0000-0000-0000-000000000000".to_string());
        argv.push("--command=sleep".to_string());
        argv.push("--".to_string());
        argv.push("5".to_string());

        let parsed = ReexecArgs::parse_from(argv);
        assert_eq!(parsed.limits(), limits);
        assert_eq!(parsed.command, "sleep");
        assert_eq!(parsed.args, vec!["5"]);
        assert!(parsed.cgroup_root.is_none());
    }

    #[test]
    fn zero_limits_parse_as_defaults() {
        let parsed = ReexecArgs::parse_from(strings(&[
            "jobworker",
            "--jobid=j1",
            "--command=true",
            "--",
        ]));
        assert_eq!(parsed.limits(), Limits::default());
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn user_flags_after_separator_stay_user_args() {
        let parsed = ReexecArgs::parse_from(strings(&[
            "jobworker",
            "--cgroup-root=/tmp/scratch",
            "--jobid=j2",
            "--command=sh",
            "--",
            "-c",
            "echo hi",
        ]));
        assert_eq!(parsed.cgroup_root, Some(PathBuf::from("/tmp/scratch")));
        assert_eq!(parsed.args, vec!["-c", "echo hi"]);
    }
}
