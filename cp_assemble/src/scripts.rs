//! Render scheduler submission scripts for the generated command files.
//!
//! Each phase becomes one SGE array job whose tasks index into the phase's
//! command file; phases are chained with `-hold_jid` so a phase only starts
//! once its predecessor's array job has completed entirely (a phase-level
//! barrier, which avoids partial-staging races at the cost of pipeline
//! depth). A master script submits every phase in dependency order.

use crate::admission::AdmissionPolicy;
use crate::commands::{command_file_path, count_lines};
use anyhow::{Context, Result};
use cp_types::error::CommandError;
use log::info;
use rand::Rng;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const DEFAULT_RUNTIME: &str = "06:00:00";
const STAGING_MEMORY: &str = "1G";
const ANALYSIS_MEMORY: &str = "12G";
const DESTAGING_MEMORY: &str = "1G";
const POST_MEMORY: &str = "4G";

/// Source of the short tokens woven into job names so that concurrent
/// submissions cannot collide at the scheduler. Injected so tests can use a
/// deterministic source.
pub trait TokenSource {
    fn token(&mut self) -> String;
}

/// Six random hex characters with a nonzero leading digit.
pub struct HexTokenSource;

impl TokenSource for HexTokenSource {
    fn token(&mut self) -> String {
        format!("{:06x}", rand::thread_rng().gen_range(0x10_0000..0x100_0000))
    }
}

/// Fixed token for deterministic script generation under test.
pub struct FixedTokenSource(pub String);

impl TokenSource for FixedTokenSource {
    fn token(&mut self) -> String {
        self.0.clone()
    }
}

/// Timestamp prefix for generated script filenames.
pub fn run_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H:%M:%S").to_string()
}

/// The schedulable phases, in dependency order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Staging,
    Analysis,
    Destaging,
    Join,
    Transfer,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Staging => "staging",
            Phase::Analysis => "analysis",
            Phase::Destaging => "destaging",
            Phase::Join => "join",
            Phase::Transfer => "transfer",
        }
    }
}

/// A single scheduler directive, rendered as one `#$` header line.
#[derive(Clone, Debug)]
enum Directive {
    Memory(String),
    Runtime(String),
    Output(PathBuf),
    Tasks(usize),
    HoldJid(String),
    Queue(String),
    ParallelEnv(String),
}

impl Directive {
    fn render(&self) -> String {
        match self {
            Directive::Memory(memory) => format!("#$ -l h_vmem={memory}"),
            Directive::Runtime(runtime) => format!("#$ -l h_rt={runtime}"),
            Directive::Output(dir) => format!("#$ -o {}", dir.display()),
            Directive::Tasks(n) => format!("#$ -t 1-{n}"),
            Directive::HoldJid(job) => format!("#$ -hold_jid {job}"),
            Directive::Queue(queue) => format!("#$ -q {queue}"),
            Directive::ParallelEnv(pe) => format!("#$ -pe {pe}"),
        }
    }
}

/// Accumulates named directives and body lines, then renders the script in
/// one deterministic pass. Nothing is spliced into a running text buffer.
pub struct ScriptBuilder {
    name: String,
    directives: Vec<Directive>,
    body: Vec<String>,
}

impl ScriptBuilder {
    pub fn new(name: &str) -> ScriptBuilder {
        ScriptBuilder {
            name: name.to_string(),
            directives: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn memory(mut self, memory: &str) -> ScriptBuilder {
        self.directives.push(Directive::Memory(memory.to_string()));
        self
    }

    pub fn runtime(mut self, runtime: &str) -> ScriptBuilder {
        self.directives.push(Directive::Runtime(runtime.to_string()));
        self
    }

    pub fn output(mut self, dir: &Path) -> ScriptBuilder {
        self.directives.push(Directive::Output(dir.to_path_buf()));
        self
    }

    pub fn tasks(mut self, n: usize) -> ScriptBuilder {
        self.directives.push(Directive::Tasks(n));
        self
    }

    pub fn hold_jid(mut self, job: &str) -> ScriptBuilder {
        self.directives.push(Directive::HoldJid(job.to_string()));
        self
    }

    pub fn queue(mut self, queue: &str) -> ScriptBuilder {
        self.directives.push(Directive::Queue(queue.to_string()));
        self
    }

    pub fn parallel_env(mut self, pe: &str) -> ScriptBuilder {
        self.directives.push(Directive::ParallelEnv(pe.to_string()));
        self
    }

    pub fn push_body(&mut self, line: impl Into<String>) {
        self.body.push(line.into());
    }

    pub fn extend_body(&mut self, lines: impl IntoIterator<Item = String>) {
        self.body.extend(lines);
    }

    /// Array-task body: extract this task's line from the command file,
    /// run it from a private one-line script. Running via a script rather
    /// than expanding `$SEED` directly keeps rsync commands with quoted
    /// spaces intact.
    pub fn array_loop(&mut self, phase: &str, command_file: &Path) {
        self.push_body(format!("SEEDFILE=\"{}\"", command_file.display()));
        self.push_body("SEED=$(awk \"NR==$SGE_TASK_ID\" \"$SEEDFILE\")");
        self.push_body("# create shell script from single command, run, then delete");
        self.push_body(format!(
            "echo \"$SEED\" > .{phase}_\"$JOB_ID\"_\"$SGE_TASK_ID\".sh"
        ));
        self.push_body(format!("bash .{phase}_\"$JOB_ID\"_\"$SGE_TASK_ID\".sh"));
        self.push_body(format!("rm .{phase}_\"$JOB_ID\"_\"$SGE_TASK_ID\".sh"));
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#!/bin/bash\n\n");
        out.push_str(&format!("#$ -N {}\n", self.name));
        out.push_str("#$ -j y\n");
        for directive in &self.directives {
            out.push_str(&directive.render());
            out.push('\n');
        }
        out.push('\n');
        for line in &self.body {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .with_context(|| format!("writing script '{}'", path.display()))?;
        Ok(())
    }
}

/// Line counts of the three command files.
#[derive(Clone, Copy, Debug)]
pub struct CommandCounts {
    pub staging: usize,
    pub analysis: usize,
    pub destaging: usize,
}

/// Count command lines per phase; differing counts mean the job units fell
/// out of alignment upstream and nothing should be submitted.
pub fn lines_in_commands(commands_location: &Path) -> Result<CommandCounts> {
    let staging = count_lines(&command_file_path(commands_location, "staging"))?;
    let analysis = count_lines(&command_file_path(commands_location, "cp_commands"))?;
    let destaging = count_lines(&command_file_path(commands_location, "destaging"))?;
    if staging != analysis || analysis != destaging {
        return Err(CommandError::MisalignedCommands {
            staging,
            analysis,
            destaging,
        }
        .into());
    }
    Ok(CommandCounts {
        staging,
        analysis,
        destaging,
    })
}

/// Polling admission guard prepended to every staging task. Marker files in
/// a shared control directory approximate the live task count; the marker
/// is removed on any exit. Randomized backoff keeps waiting tasks from
/// retrying in lockstep.
fn admission_guard(policy: &AdmissionPolicy, location: &Path) -> Vec<String> {
    vec![
        format!(
            "CONTROL_DIR=\"{}/img_data/.staging_tasks\"",
            location.display()
        ),
        "mkdir -p \"$CONTROL_DIR\"".to_string(),
        "MARKER=\"$CONTROL_DIR/task_${JOB_ID}_${SGE_TASK_ID}\"".to_string(),
        "trap 'rm -f \"$MARKER\"' EXIT".to_string(),
        "while true; do".to_string(),
        format!(
            "    USAGE=$(df --output=pcent \"{}\" | tail -n 1 | tr -dc '0-9')",
            location.display()
        ),
        "    RUNNING=$(find \"$CONTROL_DIR\" -name 'task_*' | wc -l)".to_string(),
        format!("    if [ \"$USAGE\" -lt {} ]; then", policy.moderate_pct),
        "        LIMIT=100000".to_string(),
        format!("    elif [ \"$USAGE\" -lt {} ]; then", policy.high_pct),
        format!("        LIMIT={}", policy.moderate_cap),
        format!("    elif [ \"$USAGE\" -lt {} ]; then", policy.critical_pct),
        format!("        LIMIT={}", policy.high_cap),
        "    else".to_string(),
        "        LIMIT=0".to_string(),
        "    fi".to_string(),
        "    if [ \"$RUNNING\" -lt \"$LIMIT\" ]; then".to_string(),
        "        break".to_string(),
        "    fi".to_string(),
        "    sleep $((30 + RANDOM % 60))".to_string(),
        "done".to_string(),
        "touch \"$MARKER\"".to_string(),
    ]
}

/// Completion bookkeeping appended to the analysis body: one line per
/// finished task in a shared log file. Advisory only, never read back.
fn completion_log(log_file: &Path) -> Vec<String> {
    vec![
        String::new(),
        "# record the exit status of the cellprofiler task".to_string(),
        "RETURN_VAL=$?".to_string(),
        "if [[ $RETURN_VAL == 0 ]]; then".to_string(),
        "    RETURN_STATUS=\"Finished\"".to_string(),
        "else".to_string(),
        "    RETURN_STATUS=\"Failed with error code: $RETURN_VAL\"".to_string(),
        "fi".to_string(),
        format!("LOG_FILE_LOC={}", log_file.display()),
        "echo \"`date +\"%Y%m%d %H:%M\"`  $JOB_ID  $SGE_TASK_ID  $RETURN_STATUS\" >> $LOG_FILE_LOC"
            .to_string(),
    ]
}

pub struct GenerateScriptsConfig<'a> {
    pub commands_location: &'a Path,
    /// Output location; also hosts the log directories and the staging
    /// control directory.
    pub location: &'a Path,
    /// File patterns to join after destaging; empty disables the phase.
    pub join_patterns: &'a [String],
    /// Destination for the results after everything else; `None` disables
    /// the phase.
    pub transfer_to: Option<&'a Path>,
    pub policy: AdmissionPolicy,
}

pub struct GeneratedScripts {
    pub phase_scripts: Vec<(Phase, PathBuf)>,
    pub master: PathBuf,
}

/// Render and save one submission script per phase plus the master submit
/// script, wired together through phase-level hold_jid barriers.
pub fn make_submission_scripts(
    cfg: &GenerateScriptsConfig<'_>,
    stamp: &str,
    tokens: &mut dyn TokenSource,
) -> Result<GeneratedScripts> {
    let counts = lines_in_commands(cfg.commands_location)?;
    let tag = tokens.token();
    let logfiles = cfg.location.join("logfiles");
    let mut phase_scripts: Vec<(Phase, PathBuf)> = Vec::new();

    let mut save = |script: &ScriptBuilder, phase: Phase| -> Result<PathBuf> {
        let path = cfg
            .commands_location
            .join(format!("{stamp}_{}_script.sh", phase.as_str()));
        script.save(&path)?;
        info!("saving {} submission script at '{}'", phase.as_str(), path.display());
        phase_scripts.push((phase, path.clone()));
        Ok(path)
    };

    let staging_name = format!("staging_{tag}");
    let mut staging = ScriptBuilder::new(&staging_name)
        .memory(STAGING_MEMORY)
        .runtime(DEFAULT_RUNTIME)
        .output(&logfiles.join("staging"))
        .tasks(counts.staging)
        .queue("staging");
    staging.extend_body(admission_guard(&cfg.policy, cfg.location));
    staging.array_loop("staging", &command_file_path(cfg.commands_location, "staging"));
    save(&staging, Phase::Staging)?;

    let analysis_name = format!("analysis_{tag}");
    let mut analysis = ScriptBuilder::new(&analysis_name)
        .memory(ANALYSIS_MEMORY)
        .runtime(DEFAULT_RUNTIME)
        .output(&logfiles.join("analysis"))
        .tasks(counts.analysis)
        .hold_jid(&staging_name)
        .parallel_env("sharedmem 1");
    analysis.push_body("# site-specific environment setup (module loads, virtualenv) goes here");
    analysis.array_loop(
        "analysis",
        &command_file_path(cfg.commands_location, "cp_commands"),
    );
    analysis.extend_body(completion_log(&logfiles.join(format!("{tag}.log"))));
    save(&analysis, Phase::Analysis)?;

    let destaging_name = format!("destaging_{tag}");
    let mut destaging = ScriptBuilder::new(&destaging_name)
        .memory(DESTAGING_MEMORY)
        .runtime(DEFAULT_RUNTIME)
        .output(&logfiles.join("destaging"))
        .tasks(counts.destaging)
        .hold_jid(&analysis_name);
    destaging.array_loop(
        "destaging",
        &command_file_path(cfg.commands_location, "destaging"),
    );
    save(&destaging, Phase::Destaging)?;

    let mut previous_name = destaging_name;
    if !cfg.join_patterns.is_empty() {
        let join_name = format!("join_{tag}");
        let mut join = ScriptBuilder::new(&join_name)
            .memory(POST_MEMORY)
            .runtime(DEFAULT_RUNTIME)
            .output(&logfiles)
            .hold_jid(&previous_name);
        join.push_body(format!(
            "cptools join --location {} --patterns {}",
            cfg.location.display(),
            cfg.join_patterns.join(" ")
        ));
        save(&join, Phase::Join)?;
        previous_name = join_name;
    }

    if let Some(destination) = cfg.transfer_to {
        let transfer_name = format!("transfer_{tag}");
        let mut transfer = ScriptBuilder::new(&transfer_name)
            .memory(POST_MEMORY)
            .runtime(DEFAULT_RUNTIME)
            .output(&logfiles)
            .hold_jid(&previous_name);
        transfer.push_body(format!(
            "rsync -a \"{}/\" \"{}\"",
            cfg.location.join("raw_data").display(),
            destination.display()
        ));
        save(&transfer, Phase::Transfer)?;
    }

    drop(save);
    let master = make_submit_script(cfg.commands_location, stamp, &phase_scripts)?;
    Ok(GeneratedScripts {
        phase_scripts,
        master,
    })
}

/// Shell script that qsubs every phase script in dependency order. Run
/// directly, not submitted.
fn make_submit_script(
    commands_location: &Path,
    stamp: &str,
    phase_scripts: &[(Phase, PathBuf)],
) -> Result<PathBuf> {
    let mut out = String::from("#!/bin/sh\n\n");
    out.push_str("# submits the generated phase scripts in dependency order\n");
    out.push_str("# run this as a shell script (./ or bash), not with qsub\n\n");
    for (_, path) in phase_scripts {
        out.push_str(&format!("qsub {}\n", path.display()));
    }
    let path = commands_location.join(format!("{stamp}_SUBMIT_JOBS.sh"));
    std::fs::write(&path, out)
        .with_context(|| format!("writing submit script '{}'", path.display()))?;
    make_executable(&path)?;
    info!("saving submit script at '{}'", path.display());
    Ok(path)
}

/// Set the executable bits on a generated script.
pub fn make_executable(path: &Path) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("reading permissions of '{}'", path.display()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("marking '{}' executable", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{write_commands, CommandSet};
    use tempfile::TempDir;

    const STAMP: &str = "2024-01-01-00:00:00";

    fn write_command_files(commands_location: &Path, n: usize) {
        let mut set = CommandSet::default();
        for i in 0..n {
            set.push(
                format!("stage plate_1_{i}"),
                format!("analyze plate_1_{i}"),
                format!("destage plate_1_{i}"),
            );
        }
        write_commands(commands_location, &set).unwrap();
    }

    fn generate(
        commands: &Path,
        location: &Path,
        join_patterns: &[String],
        transfer_to: Option<&Path>,
    ) -> GeneratedScripts {
        let cfg = GenerateScriptsConfig {
            commands_location: commands,
            location,
            join_patterns,
            transfer_to,
            policy: AdmissionPolicy::default(),
        };
        let mut tokens = FixedTokenSource("abc123".to_string());
        make_submission_scripts(&cfg, STAMP, &mut tokens).unwrap()
    }

    #[test]
    fn builder_renders_header_then_body() {
        let mut script = ScriptBuilder::new("analysis_abc123")
            .memory("12G")
            .runtime("06:00:00")
            .tasks(4)
            .hold_jid("staging_abc123");
        script.push_body("echo hello");
        let text = script.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(lines[2], "#$ -N analysis_abc123");
        assert_eq!(lines[3], "#$ -j y");
        assert_eq!(lines[4], "#$ -l h_vmem=12G");
        assert_eq!(lines[5], "#$ -l h_rt=06:00:00");
        assert_eq!(lines[6], "#$ -t 1-4");
        assert_eq!(lines[7], "#$ -hold_jid staging_abc123");
        assert_eq!(lines.last().unwrap(), &"echo hello");
    }

    #[test]
    fn hex_tokens_look_like_hex() {
        let mut source = HexTokenSource;
        for _ in 0..50 {
            let token = source.token();
            assert_eq!(token.len(), 6);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
            assert_ne!(token.chars().next().unwrap(), '0');
        }
    }

    #[test]
    fn mandatory_phases_and_master() {
        let commands = TempDir::new().unwrap();
        let location = TempDir::new().unwrap();
        write_command_files(commands.path(), 2);
        let generated = generate(commands.path(), location.path(), &[], None);

        let phases: Vec<Phase> = generated.phase_scripts.iter().map(|(p, _)| *p).collect();
        assert_eq!(phases, [Phase::Staging, Phase::Analysis, Phase::Destaging]);

        let staging =
            std::fs::read_to_string(&generated.phase_scripts[0].1).unwrap();
        assert!(staging.contains("#$ -N staging_abc123"));
        assert!(staging.contains("#$ -t 1-2"));
        assert!(staging.contains("#$ -q staging"));
        assert!(staging.contains("CONTROL_DIR="));
        assert!(staging.contains("trap 'rm -f \"$MARKER\"' EXIT"));

        let analysis =
            std::fs::read_to_string(&generated.phase_scripts[1].1).unwrap();
        assert!(analysis.contains("#$ -hold_jid staging_abc123"));
        assert!(analysis.contains("#$ -pe sharedmem 1"));
        assert!(analysis.contains("SEEDFILE="));
        assert!(analysis.contains("RETURN_STATUS"));

        let destaging =
            std::fs::read_to_string(&generated.phase_scripts[2].1).unwrap();
        assert!(destaging.contains("#$ -hold_jid analysis_abc123"));

        let master = std::fs::read_to_string(&generated.master).unwrap();
        let qsubs: Vec<&str> = master.lines().filter(|l| l.starts_with("qsub ")).collect();
        assert_eq!(qsubs.len(), 3);
        assert!(qsubs[0].contains("staging_script.sh"));
        assert!(qsubs[1].contains("analysis_script.sh"));
        assert!(qsubs[2].contains("destaging_script.sh"));

        let mode = std::fs::metadata(&generated.master).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn optional_phases_chain_dependencies() {
        let commands = TempDir::new().unwrap();
        let location = TempDir::new().unwrap();
        write_command_files(commands.path(), 1);
        let patterns = vec!["Image.csv".to_string(), "Cells.csv".to_string()];
        let transfer = location.path().join("archive");
        let generated = generate(commands.path(), location.path(), &patterns, Some(&transfer));

        let phases: Vec<Phase> = generated.phase_scripts.iter().map(|(p, _)| *p).collect();
        assert_eq!(
            phases,
            [
                Phase::Staging,
                Phase::Analysis,
                Phase::Destaging,
                Phase::Join,
                Phase::Transfer
            ]
        );

        let join = std::fs::read_to_string(&generated.phase_scripts[3].1).unwrap();
        assert!(join.contains("#$ -hold_jid destaging_abc123"));
        assert!(join.contains("cptools join --location"));
        assert!(join.contains("--patterns Image.csv Cells.csv"));

        let transfer_text =
            std::fs::read_to_string(&generated.phase_scripts[4].1).unwrap();
        assert!(transfer_text.contains("#$ -hold_jid join_abc123"));
        assert!(transfer_text.contains("rsync -a"));

        let master = std::fs::read_to_string(&generated.master).unwrap();
        assert_eq!(master.lines().filter(|l| l.starts_with("qsub ")).count(), 5);
    }

    #[test]
    fn misaligned_command_files_are_fatal() {
        let commands = TempDir::new().unwrap();
        write_command_files(commands.path(), 2);
        std::fs::write(command_file_path(commands.path(), "destaging"), "only one\n").unwrap();
        let err = lines_in_commands(commands.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CommandError>(),
            Some(CommandError::MisalignedCommands {
                staging: 2,
                analysis: 2,
                destaging: 1
            })
        ));
    }
}
