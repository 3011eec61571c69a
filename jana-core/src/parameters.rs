use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

/// Errors raised while parsing or mutating parameter values, per spec.md
/// §4.10.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("{0:?} is not a valid boolean (expected 0/1/true/false/on/off)")]
    BadBool(String),
    #[error("{0:?} is not a valid integer")]
    BadInt(String),
    #[error("{0:?} is not a valid float")]
    BadFloat(String),
    #[error("expected {expected} comma-separated values, found {actual}")]
    BadArity { expected: usize, actual: usize },
    #[error("parameter writes are forbidden after initialize()")]
    Locked,
}

/// Canonical text-form parse/stringify for a parameter-backed type.
///
/// Round-trips per spec.md §8: `parse(stringify(x)) == x` always; the
/// inverse holds only up to the canonicalisation rules documented on each
/// impl (e.g. boolean spellings normalise to `"0"`/`"1"`).
pub trait ParamValue: Sized {
    fn parse(raw: &str) -> Result<Self, ParameterError>;
    fn stringify(&self) -> String;
}

impl ParamValue for bool {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            _ => Err(ParameterError::BadBool(raw.to_string())),
        }
    }

    fn stringify(&self) -> String {
        if *self { "1".to_string() } else { "0".to_string() }
    }
}

impl ParamValue for i64 {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        raw.trim()
            .parse()
            .map_err(|_| ParameterError::BadInt(raw.to_string()))
    }

    fn stringify(&self) -> String {
        self.to_string()
    }
}

impl ParamValue for i32 {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        raw.trim()
            .parse()
            .map_err(|_| ParameterError::BadInt(raw.to_string()))
    }

    fn stringify(&self) -> String {
        self.to_string()
    }
}

impl ParamValue for usize {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        raw.trim()
            .parse()
            .map_err(|_| ParameterError::BadInt(raw.to_string()))
    }

    fn stringify(&self) -> String {
        self.to_string()
    }
}

/// Plain decimal formatting with no forced trailing `.0` — the form used
/// for individual elements of a sequence (`JParameterManagerTests.cc`'s
/// "Writing a vector of floats" expects `"22,49.2,42"`, not `"22.0,..."`).
fn format_float_plain(value: f64) -> String {
    format!("{value}")
}

/// Scalar float stringification. Matches
/// `JParameterManager_Replicating_Issue_233` in the original test suite:
/// a bare `Stringify<double>` call always leaves a decimal point in the
/// result, even for an integral value (`0.0` stringifies to `"0.0"`, not
/// `"0"`), while non-integral magnitudes print exactly as their shortest
/// round-tripping decimal expansion (`0.00000001`, `0.01`) with no
/// scientific notation — which is also plain `f64` `Display` behaviour.
fn format_float_scalar(value: f64) -> String {
    let plain = format_float_plain(value);
    if plain.contains('.') || plain.contains('e') || plain.contains("inf") || plain.contains("NaN")
    {
        plain
    } else {
        format!("{plain}.0")
    }
}

impl ParamValue for f64 {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        raw.trim()
            .parse()
            .map_err(|_| ParameterError::BadFloat(raw.to_string()))
    }

    fn stringify(&self) -> String {
        format_float_scalar(*self)
    }
}

impl ParamValue for f32 {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        raw.trim()
            .parse()
            .map_err(|_| ParameterError::BadFloat(raw.to_string()))
    }

    fn stringify(&self) -> String {
        format_float_scalar(*self as f64)
    }
}

impl ParamValue for String {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        Ok(raw.to_string())
    }

    fn stringify(&self) -> String {
        self.clone()
    }
}

/// How a type renders as one element of a comma-joined sequence. Distinct
/// from [`ParamValue::stringify`] only for floats: a lone `f64`/`f32`
/// parameter always carries a decimal point (`format_float_scalar`), but
/// the same value inside a `Vec`/array does not (`JParameterManagerTests.cc`'s
/// "Writing a vector of floats" expects `"22,49.2,42"`, not `"22.0,..."`).
/// No blanket impl (Rust has no specialisation on stable), so every
/// sequence-eligible type gets one line here.
trait SeqElem: ParamValue {
    fn seq_stringify(&self) -> String {
        self.stringify()
    }
}

impl SeqElem for bool {}
impl SeqElem for i64 {}
impl SeqElem for i32 {}
impl SeqElem for usize {}
impl SeqElem for String {}
impl SeqElem for f64 {
    fn seq_stringify(&self) -> String {
        format_float_plain(*self)
    }
}
impl SeqElem for f32 {
    fn seq_stringify(&self) -> String {
        format_float_plain(*self as f64)
    }
}

/// Comma-separated sequence. Elements are split verbatim (no trimming),
/// matching `JParameterManagerTests.cc`'s "Reading a vector of strings":
/// `"simple,whitespace in middle, also with whitespace padding "` yields
/// three elements, the third retaining its leading/trailing whitespace.
impl<T: SeqElem> ParamValue for Vec<T> {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        raw.split(',').map(T::parse).collect()
    }

    fn stringify(&self) -> String {
        self.iter()
            .map(SeqElem::seq_stringify)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Fixed-size tuple-like sequence (`spec.md` §4.10's "fixed-size tuples").
impl<T: SeqElem, const N: usize> ParamValue for [T; N] {
    fn parse(raw: &str) -> Result<Self, ParameterError> {
        let parts: Vec<&str> = raw.split(',').collect();
        if parts.len() != N {
            return Err(ParameterError::BadArity {
                expected: N,
                actual: parts.len(),
            });
        }
        let values: Vec<T> = parts
            .into_iter()
            .map(T::parse)
            .collect::<Result<_, _>>()?;
        values
            .try_into()
            .map_err(|_| ParameterError::BadArity { expected: N, actual: N })
    }

    fn stringify(&self) -> String {
        self.iter()
            .map(SeqElem::seq_stringify)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Relative-epsilon float equality, widened per operand magnitude
/// (spec.md §4.10, "Float equality comparisons use a relative epsilon
/// appropriate to the width").
pub fn approx_eq_f64(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= scale * 1e-9
}

pub fn approx_eq_f32(a: f32, b: f32) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= scale * 1e-5
}

struct Entry {
    value: String,
    default: Option<String>,
}

/// String-keyed, typed-accessor configuration store (spec.md §4.10).
///
/// Reads are lock-free-ish (an uncontended `RwLock` read guard) once
/// [`ParameterManager::lock`] has been called at the end of application
/// startup; writes after that point return [`ParameterError::Locked`],
/// matching "Parameter reads after `initialize()` are lock-free; writes
/// after `initialize()` are forbidden" (spec.md §5).
pub struct ParameterManager {
    entries: RwLock<HashMap<String, Entry>>,
    locked: AtomicBool,
}

impl Default for ParameterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locked: AtomicBool::new(false),
        }
    }

    /// Forbid further writes. Called once by the application host after
    /// every plugin has registered its parameters.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn ensure_unlocked(&self) -> Result<(), ParameterError> {
        if self.is_locked() {
            Err(ParameterError::Locked)
        } else {
            Ok(())
        }
    }

    /// Store `value` as its canonical string form.
    pub fn set<T: ParamValue>(&self, key: &str, value: T) -> Result<(), ParameterError> {
        self.set_raw(key, value.stringify())
    }

    /// Store a raw string as-is, e.g. for `-Pkey=value` command-line input
    /// where the value is already textual.
    pub fn set_raw(&self, key: &str, raw: impl Into<String>) -> Result<(), ParameterError> {
        self.ensure_unlocked()?;
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            default: None,
        });
        entry.value = raw.into();
        Ok(())
    }

    /// Resolve `key` against `default`: if unset, store and return
    /// `default`; if already set (from the command line, a file, or a
    /// previous `register`), parse and return the existing value. Either
    /// way, `default` is recorded for diagnostic listing.
    pub fn register<T: ParamValue + Clone>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ParameterError> {
        let default_text = default.stringify();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.default = Some(default_text);
                T::parse(&entry.value)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: default.stringify(),
                        default: Some(default_text),
                    },
                );
                Ok(default)
            }
        }
    }

    pub fn get<T: ParamValue>(&self, key: &str) -> Option<Result<T, ParameterError>> {
        self.entries.read().get(key).map(|entry| T::parse(&entry.value))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// `(key, current value, registered default)` triples, for a
    /// diagnostic parameter listing (e.g. `JANA:EXTENDED_REPORT`).
    pub fn list(&self) -> Vec<(String, String, Option<String>)> {
        let mut out: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone(), e.default.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Resolves the well-known `NTHREADS` key (spec.md §6): an integer,
    /// or the literal `Ncores` (case-insensitive) for the detected
    /// logical core count. Falls back to `default_workers` if unset.
    pub fn worker_count(&self, default_workers: usize) -> usize {
        match self.entries.read().get("NTHREADS") {
            None => default_workers,
            Some(entry) if entry.value.eq_ignore_ascii_case("ncores") => num_cpus::get(),
            Some(entry) => entry.value.trim().parse().unwrap_or(default_workers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trips_canonical_forms() {
        assert_eq!(bool::parse("1").unwrap(), true);
        assert_eq!(bool::parse("TRUE").unwrap(), true);
        assert_eq!(bool::parse("off").unwrap(), false);
        assert_eq!(true.stringify(), "1");
        assert_eq!(false.stringify(), "0");
    }

    #[test]
    fn bool_rejects_garbage() {
        assert_eq!(bool::parse("maybe"), Err(ParameterError::BadBool("maybe".into())));
    }

    #[test]
    fn float_scalar_forces_trailing_point() {
        assert_eq!(format_float_scalar(0.0), "0.0");
        assert_eq!(format_float_scalar(0.01), "0.01");
        assert_eq!(format_float_scalar(0.00000001), "0.00000001");
    }

    #[test]
    fn float_sequence_omits_forced_trailing_point() {
        let values = vec![22.0_f64, 49.2, 42.0];
        assert_eq!(values.stringify(), "22,49.2,42");
    }

    #[test]
    fn vector_of_strings_preserves_whitespace() {
        let parsed: Vec<String> =
            Vec::<String>::parse("simple,whitespace in middle, also with whitespace padding ")
                .unwrap();
        assert_eq!(parsed[0], "simple");
        assert_eq!(parsed[1], "whitespace in middle");
        assert_eq!(parsed[2], " also with whitespace padding ");
    }

    #[test]
    fn fixed_size_array_checks_arity() {
        let err = <[i64; 3]>::parse("1,2").unwrap_err();
        assert_eq!(err, ParameterError::BadArity { expected: 3, actual: 2 });
    }

    #[test]
    fn register_returns_existing_value_and_records_default() {
        let params = ParameterManager::new();
        params.set_raw("testing:dummy_var", "22").unwrap();
        let resolved: i64 = params.register("testing:dummy_var", 44).unwrap();
        assert_eq!(resolved, 22);
        let (_, value, default) = params
            .list()
            .into_iter()
            .find(|(k, _, _)| k == "testing:dummy_var")
            .unwrap();
        assert_eq!(value, "22");
        assert_eq!(default, Some("44".to_string()));
    }

    #[test]
    fn register_stores_default_when_absent() {
        let params = ParameterManager::new();
        let resolved: i64 = params.register("fresh_key", 7).unwrap();
        assert_eq!(resolved, 7);
        assert_eq!(params.get::<i64>("fresh_key").unwrap().unwrap(), 7);
    }

    #[test]
    fn writes_after_lock_are_rejected() {
        let params = ParameterManager::new();
        params.lock();
        assert_eq!(params.set_raw("k", "v"), Err(ParameterError::Locked));
    }

    #[test]
    fn worker_count_resolves_ncores_literal() {
        let params = ParameterManager::new();
        params.set_raw("NTHREADS", "Ncores").unwrap();
        assert_eq!(params.worker_count(1), num_cpus::get());
    }
}
