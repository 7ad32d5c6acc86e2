//! The scenario language: a declarative timeline of experiment actions.
//!
//! A scenario file is UTF-8 text, one action per line:
//!
//! ```text
//! # comment
//! &include common-setup.scenario
//! @0:00 annotate experiment-start
//! 0:05 start_download swarm.torrent rate=512 {1,2}
//! 1:30.5 churn '30% nodes' {!1}
//! ```
//!
//! Each non-comment, non-directive line is `TIMESPEC ACTION [ARGS]
//! [{PEERSPEC}]`. Timespecs are `[@]H:M:S`, `[@]M:S` or `[@]S` with
//! fractional seconds; the leading `@` conventionally marks "aligned to
//! experiment start" and has no effect on the computed offset. Arguments
//! are shell-token lexed; `name=value` tokens become named arguments.
//! `$NAME` is replaced with the identically-named environment variable
//! before tokenization when one is set.
//!
//! Malformed lines are logged with their source location and dropped; a
//! bad line never aborts the parse.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::filter::PeerFilter;

/// Handler for a `&name ...` preprocessor directive. Receives the rest of
/// the line after the directive name, untokenized.
pub type DirectiveFn = Box<dyn FnMut(&str)>;

/// One parsed timeline entry. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioEvent {
    /// Source file the line came from.
    pub file: String,
    /// 1-based line number within that file.
    pub line: u32,
    /// Seconds relative to the shared start instant.
    pub offset: f64,
    /// Action name to look up in the runner's registry.
    pub action: String,
    /// Positional arguments, in source order.
    pub args: Vec<String>,
    /// Named (`name=value`) arguments.
    pub kwargs: BTreeMap<String, String>,
    /// Which peers the event applies to.
    pub filter: PeerFilter,
}

/// Parser for scenario files.
///
/// Holds the include-resolution roots and the registered preprocessor
/// directives; each `parse_file` call is one pass over one file (plus
/// whatever it includes).
pub struct ScenarioParser {
    project_root: Option<PathBuf>,
    experiment_root: Option<PathBuf>,
    directives: IndexMap<String, DirectiveFn>,
}

impl ScenarioParser {
    /// Creates a parser with no include-resolution roots.
    pub fn new() -> Self {
        Self {
            project_root: None,
            experiment_root: None,
            directives: IndexMap::new(),
        }
    }

    /// Sets the project root used as the second candidate when resolving
    /// `&include` paths.
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    /// Sets the experiment root used as the third candidate when resolving
    /// `&include` paths.
    pub fn with_experiment_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.experiment_root = Some(root.into());
        self
    }

    /// Registers a handler for a `&name` preprocessor directive.
    ///
    /// `include` is built in and cannot be overridden; registering it is
    /// logged and ignored.
    pub fn register_directive(&mut self, name: impl Into<String>, handler: DirectiveFn) {
        let name = name.into();
        if name == "include" {
            warn!("Ignoring attempt to override the built-in include directive");
            return;
        }
        self.directives.insert(name, handler);
    }

    /// Parses one scenario file, resolving includes and directives, and
    /// returns its events in file order.
    ///
    /// Only an unreadable *top-level* file is an error; unresolvable
    /// includes and malformed lines are logged and skipped.
    pub fn parse_file(&mut self, path: impl AsRef<Path>) -> Result<Vec<ScenarioEvent>, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut events = Vec::new();
        self.parse_into(&text, &path.to_string_lossy(), &mut events);
        debug!(
            file = %path.display(),
            events = events.len(),
            "Parsed scenario file"
        );
        Ok(events)
    }

    /// Parses scenario text directly, labeling events with `file`.
    pub fn parse_str(&mut self, text: &str, file: &str) -> Vec<ScenarioEvent> {
        let mut events = Vec::new();
        self.parse_into(text, file, &mut events);
        events
    }

    fn parse_into(&mut self, text: &str, file: &str, out: &mut Vec<ScenarioEvent>) {
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx as u32 + 1;
            let line = substitute_env(raw);
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('&') {
                self.handle_directive(rest, file, lineno, out);
                continue;
            }

            match parse_event_line(line, file, lineno) {
                Ok(event) => out.push(event),
                Err(reason) => {
                    warn!("{file}:{lineno}: dropping malformed scenario line: {reason}");
                }
            }
        }
    }

    fn handle_directive(&mut self, rest: &str, file: &str, lineno: u32, out: &mut Vec<ScenarioEvent>) {
        let (name, body) = match rest.split_once(char::is_whitespace) {
            Some((name, body)) => (name, body.trim()),
            None => (rest.trim(), ""),
        };

        if name == "include" {
            match self.resolve_include(body) {
                Some(path) => match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        let label = path.to_string_lossy().into_owned();
                        self.parse_into(&text, &label, out);
                    }
                    Err(e) => {
                        warn!("{file}:{lineno}: cannot read include '{body}': {e}");
                    }
                },
                None => {
                    warn!("{file}:{lineno}: cannot resolve include '{body}'");
                }
            }
            return;
        }

        match self.directives.get_mut(name) {
            Some(handler) => handler(body),
            None => warn!("{file}:{lineno}: unknown directive '&{name}'"),
        }
    }

    /// Resolves an include path: as given, then relative to the project
    /// root, then relative to the experiment root.
    fn resolve_include(&self, spec: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(spec);
        if direct.is_file() {
            return Some(direct);
        }
        for root in [&self.project_root, &self.experiment_root].into_iter().flatten() {
            let candidate = root.join(spec);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for ScenarioParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces `$NAME` tokens with the value of the identically-named process
/// environment variable. Unset variables are left literal.
fn substitute_env(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let mut chars = line.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, n)) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            result.push('$');
            continue;
        }
        match std::env::var(&name) {
            Ok(value) => result.push_str(&value),
            Err(_) => {
                result.push('$');
                result.push_str(&name);
            }
        }
    }
    result
}

/// Parses `[@]H:M:S`, `[@]M:S` or `[@]S` into seconds. Fractional
/// components are allowed in any position. Offsets too large to ever
/// schedule (beyond `Duration` range) are rejected like any other
/// malformed timespec.
fn parse_timespec(spec: &str) -> Option<f64> {
    let spec = spec.strip_prefix('@').unwrap_or(spec);
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut total = 0.0;
    for part in &parts {
        let value: f64 = part.parse().ok()?;
        if value < 0.0 || !value.is_finite() {
            return None;
        }
        total = total * 60.0 + value;
    }
    if std::time::Duration::try_from_secs_f64(total).is_err() {
        return None;
    }
    Some(total)
}

/// Splits a line into shell-style tokens. Single and double quotes group
/// words; backslash escapes the next character. Returns `None` on an
/// unterminated quote or trailing backslash.
fn lex(input: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut pending = false;
    let mut chars = input.chars();

    #[derive(PartialEq)]
    enum Mode {
        Plain,
        Single,
        Double,
    }
    let mut mode = Mode::Plain;

    while let Some(c) = chars.next() {
        match mode {
            Mode::Single => {
                if c == '\'' {
                    mode = Mode::Plain;
                } else {
                    current.push(c);
                }
            }
            Mode::Double => match c {
                '"' => mode = Mode::Plain,
                '\\' => current.push(chars.next()?),
                _ => current.push(c),
            },
            Mode::Plain => match c {
                '\'' => {
                    mode = Mode::Single;
                    pending = true;
                }
                '"' => {
                    mode = Mode::Double;
                    pending = true;
                }
                '\\' => {
                    current.push(chars.next()?);
                    pending = true;
                }
                c if c.is_whitespace() => {
                    if pending {
                        tokens.push(std::mem::take(&mut current));
                        pending = false;
                    }
                }
                _ => {
                    current.push(c);
                    pending = true;
                }
            },
        }
    }

    if mode != Mode::Plain {
        return None;
    }
    if pending {
        tokens.push(current);
    }
    Some(tokens)
}

/// Carves a trailing `{...}` peer-filter group off a line, if present.
///
/// Runs the same quote and escape rules as [`lex`], so braces inside
/// quotes or behind a backslash are ordinary argument text. Only a bare
/// `}` as the line's final character triggers the carve; it pairs with
/// the last bare `{` before it. A bare trailing `}` with no bare `{` is
/// an error.
fn split_trailing_filter(line: &str) -> Result<(&str, Option<&str>), String> {
    #[derive(PartialEq)]
    enum Mode {
        Plain,
        Single,
        Double,
    }
    let mut mode = Mode::Plain;
    let mut last_open = None;
    let mut ends_with_bare_close = false;
    let mut chars = line.char_indices();

    while let Some((i, c)) = chars.next() {
        match mode {
            Mode::Single => {
                if c == '\'' {
                    mode = Mode::Plain;
                }
            }
            Mode::Double => match c {
                '"' => mode = Mode::Plain,
                '\\' => {
                    chars.next();
                }
                _ => {}
            },
            Mode::Plain => match c {
                '\'' => mode = Mode::Single,
                '"' => mode = Mode::Double,
                '\\' => {
                    chars.next();
                }
                '{' => last_open = Some(i),
                '}' => ends_with_bare_close = i + 1 == line.len(),
                _ => {}
            },
        }
    }

    if !ends_with_bare_close {
        return Ok((line, None));
    }
    match last_open {
        Some(open) => Ok((&line[..open], Some(&line[open + 1..line.len() - 1]))),
        None => Err("'}' without matching '{'".to_string()),
    }
}

/// Parses one substituted, trimmed, non-comment scenario line.
fn parse_event_line(line: &str, file: &str, lineno: u32) -> Result<ScenarioEvent, String> {
    // Trailing {...} is the peer filter; carve it off before lexing so
    // unquoted commas inside it survive.
    let (body, filter) = match split_trailing_filter(line)? {
        (body, Some(spec)) => (body, PeerFilter::from_spec(spec).map_err(|e| e.to_string())?),
        (body, None) => (body, PeerFilter::All),
    };

    let tokens = lex(body).ok_or_else(|| "unterminated quote or escape".to_string())?;
    if tokens.len() < 2 {
        return Err("expected TIMESPEC ACTION".to_string());
    }

    let offset = parse_timespec(&tokens[0])
        .ok_or_else(|| format!("bad timespec '{}'", tokens[0]))?;
    let action = tokens[1].clone();

    let mut args = Vec::new();
    let mut kwargs = BTreeMap::new();
    for token in &tokens[2..] {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                kwargs.insert(key.to_string(), value.to_string());
            }
            _ => args.push(token.clone()),
        }
    }

    Ok(ScenarioEvent {
        file: file.to_string(),
        line: lineno,
        offset,
        action,
        args,
        kwargs,
        filter,
    })
}
