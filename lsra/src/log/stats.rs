//! This module records statistics about register allocation, both per method (see [AllocStats])
//! and, if the `LSRA_LOG_STATS` environment variable is set, aggregated over all the methods a
//! process compiles. Durations are wall-clock time, so they are very much in "best effort"
//! territory.

use parking_lot::Mutex;
use std::{
    env, fs,
    ops::{Index, IndexMut},
    sync::LazyLock,
    time::Duration,
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// The events we count.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, Eq, PartialEq)]
// Each variant's `to_string` is the name of the key that will appear in the JSON stats.
pub enum Stat {
    /// A register value was stored to a spill temp or to a local's home.
    #[strum(to_string = "spills")]
    Spill,
    /// A spilled value was loaded back into a register.
    #[strum(to_string = "reloads")]
    Reload,
    /// A spilled constant was rematerialised rather than reloaded.
    #[strum(to_string = "remats")]
    Remat,
    /// A value was copied to another register for a single use.
    #[strum(to_string = "copies")]
    Copy,
    /// A value was moved to another register for the rest of its lifetime.
    #[strum(to_string = "moves")]
    Move,
    /// A reg-optional use was left in memory.
    #[strum(to_string = "mem_uses")]
    MemUse,
    /// A move or swap was inserted at a block boundary.
    #[strum(to_string = "resolution_moves")]
    ResolutionMove,
    /// A critical edge was split.
    #[strum(to_string = "split_edges")]
    SplitEdge,
}

/// Per-method allocation statistics.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocStats([u64; Stat::COUNT]);

impl AllocStats {
    pub fn inc(&mut self, stat: Stat) {
        self.0[stat as usize] += 1;
    }
}

impl Index<Stat> for AllocStats {
    type Output = u64;

    fn index(&self, stat: Stat) -> &u64 {
        &self.0[stat as usize]
    }
}

impl IndexMut<Stat> for AllocStats {
    fn index_mut(&mut self, stat: Stat) -> &mut u64 {
        &mut self.0[stat as usize]
    }
}

/// Process-wide statistics, recorded only if the end user defines `LSRA_LOG_STATS`.
pub(crate) struct Stats {
    // Most of the time no-one wants statistics, so the outer `Option` makes "are any stats to be
    // recorded?" a simple null check: only if stats are to be recorded do we lock the `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    methods_compiled_ok: u64,
    methods_compiled_err: u64,
    totals: AllocStats,
    duration_compiling: Duration,
}

impl Stats {
    fn new() -> Self {
        match env::var("LSRA_LOG_STATS") {
            Ok(p) => Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            },
            Err(_) => Self { inner: None },
        }
    }

    /// If `LSRA_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut mtx.lock());
        }
    }

    /// Record a successful compilation.
    pub(crate) fn method_compiled_ok(&self, stats: &AllocStats, d: Duration) {
        self.update_with(|inner| {
            inner.methods_compiled_ok += 1;
            for s in Stat::iter() {
                inner.totals[s] += stats[s];
            }
            inner.duration_compiling = inner.duration_compiling.saturating_add(d);
        });
    }

    /// Record an unsuccessful compilation.
    pub(crate) fn method_compiled_err(&self, d: Duration) {
        self.update_with(|inner| {
            inner.methods_compiled_err += 1;
            inner.duration_compiling = inner.duration_compiling.saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            methods_compiled_ok: 0,
            methods_compiled_err: 0,
            totals: AllocStats::default(),
            duration_compiling: Duration::new(0, 0),
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        let d = self.duration_compiling;
        let mut fields = vec![
            (
                "methods_compiled_ok".to_owned(),
                self.methods_compiled_ok.to_string(),
            ),
            (
                "methods_compiled_err".to_owned(),
                self.methods_compiled_err.to_string(),
            ),
            (
                "duration_compiling".to_owned(),
                format!("{}.{:03}", d.as_secs(), d.subsec_millis()),
            ),
        ];
        for s in Stat::iter() {
            fields.push((s.to_string(), self.totals[s].to_string()));
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

static STATS: LazyLock<Stats> = LazyLock::new(Stats::new);

/// The process-wide [Stats].
pub(crate) fn stats() -> &'static Stats {
    &STATS
}
