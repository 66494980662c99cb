//! The implementation of the `LSRA_LOG*` environment variables.
//!
//! Note that IR logging is only meaningfully available when the `lsrad` feature is enabled:
//! otherwise we expose no-op functions.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf, sync::LazyLock};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log the start and end of each method's compilation.
    MethodEvent,
    /// Log individual allocation decisions (spills, splits, resolution).
    AllocEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("LSRA_LOG") {
            Ok(s) => Self::from_str(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // If there's an existing log file, truncate (i.e. empty it), so that later
                    // appends to the log aren't appending to a previous log run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("LSRA_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid LSRA_LOG level '{s}': {e}"))?;
        // This unwrap can only fail dynamically if we've got the types wrong statically (i.e. it'll
        // fail as soon as this code is executed for the first time).
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("LSRA_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "lsra-error",
                Verbosity::Warning => "lsra-warning",
                Verbosity::MethodEvent => "lsra-method",
                Verbosity::AllocEvent => "lsra-alloc",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

static LOG: LazyLock<Log> = LazyLock::new(|| Log::new().unwrap_or_else(|e| panic!("{e}")));

/// The process-wide [Log].
pub(crate) fn log() -> &'static Log {
    &LOG
}

#[derive(Eq, Hash, PartialEq)]
#[allow(dead_code)]
pub(crate) enum IRPhase {
    /// The IR as handed to the allocator.
    Input,
    /// The IR after lowering, with each node's register requirements.
    Lowered,
    /// The reference positions and intervals.
    RefPositions,
    /// The IR after allocation and resolution, with assigned registers.
    Allocated,
}

#[cfg(not(feature = "lsrad"))]
mod internals {
    use super::IRPhase;
    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }
    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "lsrad")]
mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let mut log_phases = HashSet::new();
        if let Ok(x) = env::var("LSRA_LOG_IR") {
            let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, phases] => (*path, *phases),
                [phases] => ("-", *phases),
                _ => panic!("LSRA_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"),
            };
            for x in phases.split(',') {
                log_phases.insert(IRPhase::from_str(x).unwrap());
            }
            if path != "-" {
                // If there's an existing log file, truncate (i.e. empty it), so that later
                // appends to the log aren't appending to a previous log run.
                File::create(path).ok();
            }
            Some((path.to_string(), log_phases))
        } else {
            None
        }
    });

    impl IRPhase {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "input" => Ok(Self::Input),
                "lowered" => Ok(Self::Lowered),
                "refpositions" => Ok(Self::RefPositions),
                "allocated" => Ok(Self::Allocated),
                _ => Err(format!("Invalid LSRA_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        if let Some(true) = LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)) {
            return true;
        }
        false
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
