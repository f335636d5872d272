//! Project and task tracking inside a single markdown document.
//!
//! The document text is the only state. Sections, projects, tasks and their
//! updates are derived from it on every parse, and every structural edit is a
//! pure function from text (plus line coordinates) to new text.

pub mod core {
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------ Document ------------------------------ */

    /// Immutable line array backing the active or the archive document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        lines: Vec<String>,
        trailing_newline: bool,
    }

    impl Document {
        /// Split text into lines. A single trailing `\n` is recorded as a flag
        /// instead of producing an empty last line, so `to_text` is byte exact.
        pub fn from_text(text: &str) -> Self {
            let (body, trailing_newline) = match text.strip_suffix('\n') {
                Some(body) => (body, true),
                None => (text, false),
            };
            let lines = if body.is_empty() && !trailing_newline {
                Vec::new()
            } else {
                split_lines(body)
            };
            Self {
                lines,
                trailing_newline,
            }
        }

        pub fn from_lines(lines: Vec<String>, trailing_newline: bool) -> Self {
            Self {
                lines,
                trailing_newline,
            }
        }

        pub fn to_text(&self) -> String {
            if self.lines.is_empty() {
                return String::new();
            }
            let mut out = self.lines.join("\n");
            if self.trailing_newline {
                out.push('\n');
            }
            out
        }

        pub fn lines(&self) -> &[String] {
            &self.lines
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }

        pub fn line(&self, index: usize) -> Option<&str> {
            self.lines.get(index).map(String::as_str)
        }

        pub fn trailing_newline(&self) -> bool {
            self.trailing_newline
        }

        /// `RangeInvalid` unless `range` is ordered and inside the document.
        pub fn check_range(&self, range: LineRange) -> Result<(), EngineError> {
            if range.start > range.end || range.end >= self.lines.len() {
                return Err(EngineError::RangeInvalid {
                    start: range.start,
                    end: range.end,
                    len: self.lines.len(),
                });
            }
            Ok(())
        }

        /// `RangeInvalid` unless `at` is a valid insertion point (`0..=len`).
        pub fn check_insertion_point(&self, at: Absolute) -> Result<(), EngineError> {
            if at.0 > self.lines.len() {
                return Err(EngineError::RangeInvalid {
                    start: at.0,
                    end: at.0,
                    len: self.lines.len(),
                });
            }
            Ok(())
        }

        /// The lines of an inclusive range.
        pub fn block(&self, range: LineRange) -> Result<&[String], EngineError> {
            self.check_range(range)?;
            Ok(&self.lines[range.start..=range.end])
        }

        /// New document with `remove` lines at `at` replaced by `insert`.
        ///
        /// Callers validate `at`. An empty document that gains lines becomes
        /// newline-terminated.
        pub fn splice<S: AsRef<str>>(&self, at: usize, remove: usize, insert: &[S]) -> Document {
            let tail = (at + remove).min(self.lines.len());
            let lines: Vec<String> = self.lines[..at]
                .iter()
                .cloned()
                .chain(insert.iter().map(|line| line.as_ref().to_string()))
                .chain(self.lines[tail..].iter().cloned())
                .collect();
            Document {
                lines,
                trailing_newline: self.trailing_newline || self.lines.is_empty(),
            }
        }

        pub fn remove(&self, at: usize, count: usize) -> Document {
            self.splice::<&str>(at, count, &[])
        }
    }

    impl fmt::Display for Document {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.to_text())
        }
    }

    impl From<&str> for Document {
        fn from(text: &str) -> Self {
            Self::from_text(text)
        }
    }

    /// Split a content fragment on `\n`, keeping empty pieces.
    pub fn split_lines(text: &str) -> Vec<String> {
        text.split('\n').map(str::to_string).collect()
    }

    /* ---------------------------- Coordinates ---------------------------- */

    /// A line index into the document being read or mutated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Absolute(pub usize);

    /// A line index counted from the first line of a project, as shown by a
    /// single-project view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RelativeToProject {
        pub project_start: usize,
        pub line: usize,
    }

    impl RelativeToProject {
        pub fn to_absolute(self) -> Absolute {
            Absolute(self.project_start + self.line)
        }
    }

    impl From<RelativeToProject> for Absolute {
        fn from(rel: RelativeToProject) -> Self {
            rel.to_absolute()
        }
    }

    impl Absolute {
        /// Translate into `project`'s local coordinates; `None` outside it.
        pub fn relative_to(self, project: &Project) -> Option<RelativeToProject> {
            project.contains(self.0).then(|| RelativeToProject {
                project_start: project.start_line,
                line: self.0 - project.start_line,
            })
        }
    }

    /// Inclusive range of absolute lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LineRange {
        pub start: usize,
        pub end: usize,
    }

    impl LineRange {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn single(line: usize) -> Self {
            Self {
                start: line,
                end: line,
            }
        }

        pub fn line_count(&self) -> usize {
            (self.end + 1).saturating_sub(self.start)
        }

        pub fn contains(&self, line: usize) -> bool {
            line >= self.start && line <= self.end
        }
    }

    /* ------------------------------ Sections ------------------------------ */

    /// A level 1-3 heading.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Heading {
        pub text: String,
        /// Normalised, not unique.
        pub slug: String,
        pub level: u8,
        pub line: usize,
    }

    impl Heading {
        pub fn new(level: u8, text: &str, line: usize) -> Self {
            Self {
                text: text.to_string(),
                slug: slugify(text),
                level,
                line,
            }
        }
    }

    /// Lowercase, drop non-word characters, collapse whitespace into `-`.
    pub fn slugify(text: &str) -> String {
        let kept: String = text
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
            .collect();
        kept.split_whitespace().collect::<Vec<_>>().join("-")
    }

    /// Contiguous line range starting at a heading, or the headless preamble.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub start_line: usize,
        pub end_line: usize,
        pub content: String,
        pub heading: Option<Heading>,
    }

    impl Section {
        pub fn new(doc: &Document, range: LineRange, heading: Option<Heading>) -> Self {
            Self {
                start_line: range.start,
                end_line: range.end,
                content: doc.lines()[range.start..=range.end].join("\n"),
                heading,
            }
        }

        pub fn range(&self) -> LineRange {
            LineRange::new(self.start_line, self.end_line)
        }

        pub fn is_preamble(&self) -> bool {
            self.heading.is_none()
        }
    }

    /* -------------------------------- Tasks -------------------------------- */

    /// The character between the brackets of a task line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Checkbox {
        #[default]
        Open, // [ ]
        Done,   // [x]
        Pinned, // [!]
    }

    impl Checkbox {
        pub fn from_marker(marker: char) -> Option<Self> {
            match marker {
                ' ' => Some(Self::Open),
                'x' | 'X' => Some(Self::Done),
                '!' => Some(Self::Pinned),
                _ => None,
            }
        }

        pub fn marker(self) -> char {
            match self {
                Self::Open => ' ',
                Self::Done => 'x',
                Self::Pinned => '!',
            }
        }
    }

    /// Money amount from a `($N.NN)` annotation. `raw` keeps the literal digits.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Cost {
        pub raw: String,
        pub cents: u64,
    }

    impl Cost {
        /// Parse `N`, `N.N` or `N.NN`.
        pub fn parse(raw: &str) -> Option<Self> {
            let (whole, frac) = match raw.split_once('.') {
                Some((whole, frac)) => (whole, Some(frac)),
                None => (raw, None),
            };
            if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let frac_cents = match frac {
                None => 0,
                Some(f) if (1..=2).contains(&f.len()) && f.bytes().all(|b| b.is_ascii_digit()) => {
                    let value: u64 = f.parse().ok()?;
                    if f.len() == 1 { value * 10 } else { value }
                }
                Some(_) => return None,
            };
            let whole: u64 = whole.parse().ok()?;
            Some(Self {
                raw: raw.to_string(),
                cents: whole.checked_mul(100)?.checked_add(frac_cents)?,
            })
        }
    }

    impl fmt::Display for Cost {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "${}", self.raw)
        }
    }

    /// A dated progress note under a task.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskUpdate {
        pub line_index: usize,
        pub date: NaiveDate,
        pub text: String,
        pub assignee_alias: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub line_index: usize,
        /// Display text with annotations stripped.
        pub text: String,
        pub completed: bool,
        pub pinned: bool,
        pub assignee_alias: Option<String>,
        pub creation_date: Option<NaiveDate>,
        pub completion_date: Option<NaiveDate>,
        pub due_date: Option<NaiveDate>,
        pub cost: Option<Cost>,
        /// In written order, not calendar order.
        #[serde(default)]
        pub updates: Vec<TaskUpdate>,
        /// Last line of the task block; never before `line_index`.
        pub block_end_line: usize,
        /// Enclosing heading texts, outermost first.
        #[serde(default)]
        pub heading_hierarchy: Vec<String>,
        pub project_title: Option<String>,
    }

    impl Task {
        pub fn block(&self) -> LineRange {
            LineRange::new(self.line_index, self.block_end_line)
        }

        pub fn checkbox(&self) -> Checkbox {
            if self.completed {
                Checkbox::Done
            } else if self.pinned {
                Checkbox::Pinned
            } else {
                Checkbox::Open
            }
        }
    }

    /* ------------------------------ Projects ------------------------------ */

    /// A level-1 heading and everything up to the next one.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Project {
        pub title: String,
        pub slug: String,
        pub start_line: usize,
        pub end_line: usize,
        /// Level 2-3 headings inside the project (table of contents).
        #[serde(default)]
        pub headings: Vec<Heading>,
        /// Keyed by alias in order of first appearance.
        #[serde(default)]
        pub grouped_tasks: IndexMap<String, Vec<Task>>,
        #[serde(default)]
        pub unassigned_tasks: Vec<Task>,
    }

    impl Project {
        pub fn new(heading: &Heading) -> Self {
            Self {
                title: heading.text.clone(),
                slug: heading.slug.clone(),
                start_line: heading.line,
                end_line: heading.line,
                headings: vec![],
                grouped_tasks: IndexMap::new(),
                unassigned_tasks: vec![],
            }
        }

        pub fn range(&self) -> LineRange {
            LineRange::new(self.start_line, self.end_line)
        }

        pub fn contains(&self, line: usize) -> bool {
            self.range().contains(line)
        }

        pub fn push_task(&mut self, task: Task) {
            match task.assignee_alias.clone() {
                Some(alias) => self.grouped_tasks.entry(alias).or_default().push(task),
                None => self.unassigned_tasks.push(task),
            }
        }

        /// Every task in document order.
        pub fn tasks(&self) -> Vec<&Task> {
            let mut all: Vec<&Task> = self
                .grouped_tasks
                .values()
                .flatten()
                .chain(self.unassigned_tasks.iter())
                .collect();
            all.sort_by_key(|task| task.line_index);
            all
        }

        /// Project-local coordinate for an absolute line inside the project.
        pub fn relative(&self, line: Absolute) -> Option<RelativeToProject> {
            line.relative_to(self)
        }

        pub fn absolute(&self, line: usize) -> Absolute {
            RelativeToProject {
                project_start: self.start_line,
                line,
            }
            .to_absolute()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Rejected structural edits. A rejected edit changes neither document.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EngineError {
        #[error("line range {start}..={end} is invalid for a document of {len} lines")]
        RangeInvalid { start: usize, end: usize, len: usize },
        #[error("destination line {destination} lies inside section {start}..={end}")]
        SectionOverlap {
            destination: usize,
            start: usize,
            end: usize,
        },
        #[error("no section at lines {start}..={end}")]
        SectionNotFound { start: usize, end: usize },
        #[error("no task at line {line}")]
        TaskNotFound { line: usize },
        #[error("edit was computed against revision {expected} but the document is at {actual}")]
        StaleRevision { expected: u64, actual: u64 },
    }

    pub type EngineResult<T> = Result<T, EngineError>;

}

pub mod annotations {
    //! Inline annotation tokens carried by task and update text.
    //!
    //! A token is one whitespace-free word: `~date` (completion), `($cost)`,
    //! `(@alias)`, `+date` (creation), `!date` (due). Tokens are peeled off the end
    //! of the text first, so completion and cost are only recognised there; the
    //! remaining kinds are also taken from anywhere in the text (first occurrence).
    //! There is no escaping: text that looks like a token is a token.

    use crate::core::Cost;
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, digit1},
        combinator::{all_consuming, map, map_opt, map_res, opt, recognize},
        error::VerboseError,
        sequence::{delimited, preceded, tuple},
    };
    use std::ops::Range;

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum AnnotationKind {
        Completion,
        Cost,
        Assignee,
        Created,
        Due,
    }

    impl AnnotationKind {
        pub const ALL: [AnnotationKind; 5] = [
            AnnotationKind::Completion,
            AnnotationKind::Cost,
            AnnotationKind::Assignee,
            AnnotationKind::Created,
            AnnotationKind::Due,
        ];

        fn trailing_only(self) -> bool {
            matches!(self, AnnotationKind::Completion | AnnotationKind::Cost)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Annotation {
        Completion(NaiveDate),
        Cost(Cost),
        Assignee(String),
        Created(NaiveDate),
        Due(NaiveDate),
    }

    impl Annotation {
        pub fn kind(&self) -> AnnotationKind {
            match self {
                Annotation::Completion(_) => AnnotationKind::Completion,
                Annotation::Cost(_) => AnnotationKind::Cost,
                Annotation::Assignee(_) => AnnotationKind::Assignee,
                Annotation::Created(_) => AnnotationKind::Created,
                Annotation::Due(_) => AnnotationKind::Due,
            }
        }

        /// The token as written in a document.
        pub fn render(&self) -> String {
            match self {
                Annotation::Completion(date) => format!("~{date}"),
                Annotation::Cost(cost) => format!("(${})", cost.raw),
                Annotation::Assignee(alias) => format!("(@{alias})"),
                Annotation::Created(date) => format!("+{date}"),
                Annotation::Due(date) => format!("!{date}"),
            }
        }
    }

    /// A recognised token and its byte span in the scanned text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Found {
        pub annotation: Annotation,
        pub span: Range<usize>,
    }

    /// Display text plus the annotations stripped from it, in text order.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Scan {
        pub text: String,
        pub found: Vec<Found>,
    }

    impl Scan {
        pub fn get(&self, kind: AnnotationKind) -> Option<&Found> {
            self.found.iter().find(|f| f.annotation.kind() == kind)
        }

        pub fn date(&self, kind: AnnotationKind) -> Option<NaiveDate> {
            match self.get(kind).map(|f| &f.annotation) {
                Some(Annotation::Completion(d) | Annotation::Created(d) | Annotation::Due(d)) => {
                    Some(*d)
                }
                _ => None,
            }
        }

        pub fn assignee(&self) -> Option<&str> {
            match self.get(AnnotationKind::Assignee).map(|f| &f.annotation) {
                Some(Annotation::Assignee(alias)) => Some(alias),
                _ => None,
            }
        }

        pub fn cost(&self) -> Option<&Cost> {
            match self.get(AnnotationKind::Cost).map(|f| &f.annotation) {
                Some(Annotation::Cost(cost)) => Some(cost),
                _ => None,
            }
        }
    }

    /// Strip the annotations of `kinds` from `raw`. Malformed tokens stay text.
    pub fn scan(raw: &str, kinds: &[AnnotationKind]) -> Scan {
        let words = words(raw);
        let mut consumed = vec![false; words.len()];
        let mut found: Vec<Found> = Vec::new();
        let wanted = |kind: AnnotationKind, found: &[Found]| -> bool {
            kinds.contains(&kind) && !found.iter().any(|f| f.annotation.kind() == kind)
        };

        // The trailing run ends at the first word that is not a token; tokens
        // of an unwanted or already seen kind inside it stay text.
        for (idx, span) in words.iter().enumerate().rev() {
            let Some(annotation) = annotation_word(&raw[span.clone()]) else {
                break;
            };
            if wanted(annotation.kind(), &found) {
                consumed[idx] = true;
                found.push(Found {
                    annotation,
                    span: span.clone(),
                });
            }
        }

        for (idx, span) in words.iter().enumerate() {
            if consumed[idx] {
                continue;
            }
            let word = &raw[span.clone()];
            match annotation_prefix(word) {
                Some((annotation, len)) => {
                    let kind = annotation.kind();
                    if kind.trailing_only() || !wanted(kind, &found) {
                        continue;
                    }
                    consumed[idx] = true;
                    found.push(Found {
                        annotation,
                        span: span.start..span.start + len,
                    });
                }
                None if looks_like_annotation(word) => {
                    tracing::debug!(token = word, "malformed annotation kept as text");
                }
                None => {}
            }
        }

        found.sort_by_key(|f| f.span.start);
        let text = strip_spans(raw, found.iter().map(|f| f.span.clone()));
        Scan { text, found }
    }

    /// Set (or replace) the completion date on raw task text.
    pub fn set_completion(raw: &str, date: NaiveDate) -> String {
        let token = Annotation::Completion(date).render();
        match completion_span(raw) {
            Some(span) => format!("{}{}{}", &raw[..span.start], token, &raw[span.end..]),
            None if raw.is_empty() => token,
            None => format!("{raw} {token}"),
        }
    }

    /// Remove every completion date in the trailing run, each with the single
    /// space written before it.
    pub fn clear_completion(raw: &str) -> String {
        let mut out = raw.to_string();
        while let Some(span) = completion_span(&out) {
            let start = if out[..span.start].ends_with(' ') {
                span.start - 1
            } else {
                span.start
            };
            out.replace_range(start..span.end, "");
        }
        out
    }

    /// Last `~date` among the trailing annotation words, whatever their kinds.
    fn completion_span(raw: &str) -> Option<Range<usize>> {
        words(raw)
            .into_iter()
            .rev()
            .map_while(|span| annotation_word(&raw[span.clone()]).map(|a| (a, span)))
            .find(|(annotation, _)| annotation.kind() == AnnotationKind::Completion)
            .map(|(_, span)| span)
    }

    fn words(text: &str) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        let mut start = None;
        for (idx, ch) in text.char_indices() {
            match (ch.is_whitespace(), start) {
                (true, Some(s)) => {
                    out.push(s..idx);
                    start = None;
                }
                (false, None) => start = Some(idx),
                _ => {}
            }
        }
        if let Some(s) = start {
            out.push(s..text.len());
        }
        out
    }

    /// Remove each span together with the whitespace before it.
    fn strip_spans(raw: &str, spans: impl Iterator<Item = Range<usize>>) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut cursor = 0;
        for span in spans {
            out.push_str(raw[cursor..span.start].trim_end());
            cursor = span.end;
        }
        out.push_str(&raw[cursor..]);
        out.trim().to_string()
    }

    fn looks_like_annotation(word: &str) -> bool {
        let mut chars = word.chars();
        match (chars.next(), chars.next()) {
            (Some('~' | '+' | '!'), Some(c)) => c.is_ascii_digit(),
            (Some('('), Some('@' | '$')) => true,
            _ => false,
        }
    }

    fn annotation_word(word: &str) -> Option<Annotation> {
        all_consuming(annotation)(word).ok().map(|(_, a)| a)
    }

    /// A token at the start of `word`, followed by nothing or by a non-word
    /// character such as punctuation. Returns the token's byte length.
    fn annotation_prefix(word: &str) -> Option<(Annotation, usize)> {
        let (rest, annotation) = annotation(word).ok()?;
        if rest
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            return None;
        }
        Some((annotation, word.len() - rest.len()))
    }

    fn annotation(i: &str) -> PResult<'_, Annotation> {
        alt((
            map(preceded(char('~'), parse_date), Annotation::Completion),
            map(preceded(char('+'), parse_date), Annotation::Created),
            map(preceded(char('!'), parse_date), Annotation::Due),
            map(delimited(tag("(@"), parse_alias, char(')')), |alias: &str| {
                Annotation::Assignee(alias.to_string())
            }),
            map_opt(delimited(tag("($"), parse_amount, char(')')), |raw: &str| {
                Cost::parse(raw).map(Annotation::Cost)
            }),
        ))(i)
    }

    pub(crate) fn parse_alias(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(i)
    }

    fn parse_amount(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            digit1,
            opt(preceded(char('.'), take_while_m_n(1, 2, char_is_digit))),
        )))(i)
    }

    /// `YYYY-MM-DD`, validated as a calendar date.
    pub(crate) fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
        }

        #[test]
        fn strips_every_kind_from_the_tail() {
            let scan = scan(
                "ship it +2024-01-01 (@ana) !2024-02-01 ($12.50) ~2024-01-20",
                &AnnotationKind::ALL,
            );
            assert_eq!(scan.text, "ship it");
            assert_eq!(scan.date(AnnotationKind::Created), Some(date("2024-01-01")));
            assert_eq!(scan.date(AnnotationKind::Due), Some(date("2024-02-01")));
            assert_eq!(scan.date(AnnotationKind::Completion), Some(date("2024-01-20")));
            assert_eq!(scan.assignee(), Some("ana"));
            assert_eq!(scan.cost().map(|c| c.cents), Some(1250));
        }

        #[test]
        fn completion_followed_by_assignee_is_still_trailing() {
            let scan = scan("pay rent ~2024-01-05 (@joe)", &AnnotationKind::ALL);
            assert_eq!(scan.text, "pay rent");
            assert_eq!(scan.date(AnnotationKind::Completion), Some(date("2024-01-05")));
            assert_eq!(scan.assignee(), Some("joe"));
        }

        #[test]
        fn anywhere_kinds_are_taken_from_the_middle() {
            let scan = scan("call (@bo) about +2024-03-01 the lease", &AnnotationKind::ALL);
            assert_eq!(scan.text, "call about the lease");
            assert_eq!(scan.assignee(), Some("bo"));
            assert_eq!(scan.date(AnnotationKind::Created), Some(date("2024-03-01")));
        }

        #[test]
        fn trailing_only_kinds_in_the_middle_stay_text() {
            let scan = scan("refund ($5) please", &AnnotationKind::ALL);
            assert_eq!(scan.text, "refund ($5) please");
            assert!(scan.cost().is_none());
        }

        #[test]
        fn malformed_tokens_are_left_as_text() {
            let scan = scan("fix +2024-13-45 and !tomorrow (@bad-alias)", &AnnotationKind::ALL);
            assert_eq!(scan.text, "fix +2024-13-45 and !tomorrow (@bad-alias)");
            assert!(scan.found.is_empty());
        }

        #[test]
        fn duplicate_kind_keeps_the_last_one() {
            let scan = scan("a (@one) (@two)", &AnnotationKind::ALL);
            assert_eq!(scan.assignee(), Some("two"));
            assert_eq!(scan.text, "a (@one)");
        }

        #[test]
        fn tokens_followed_by_punctuation_are_recognised() {
            let scan_a = scan("ask (@bo), then call", &AnnotationKind::ALL);
            assert_eq!(scan_a.assignee(), Some("bo"));
            assert_eq!(scan_a.text, "ask, then call");

            let scan_b = scan("due by !2024-05-01.", &AnnotationKind::ALL);
            assert_eq!(scan_b.date(AnnotationKind::Due), Some(date("2024-05-01")));
            assert_eq!(scan_b.text, "due by.");

            let glued = scan("ref +2024-01-01x", &AnnotationKind::ALL);
            assert!(glued.found.is_empty());
        }

        #[test]
        fn trailing_run_continues_past_a_repeated_kind() {
            let scan = scan("a ~2024-01-01 (@x) (@y)", &AnnotationKind::ALL);
            assert_eq!(scan.assignee(), Some("y"));
            assert_eq!(scan.date(AnnotationKind::Completion), Some(date("2024-01-01")));
            assert_eq!(scan.text, "a (@x)");
        }

        #[test]
        fn completion_is_found_behind_duplicate_assignees() {
            let raw = "a ~2024-01-01 (@x) (@y)";
            assert_eq!(clear_completion(raw), "a (@x) (@y)");
            assert_eq!(
                set_completion(raw, date("2024-02-02")),
                "a ~2024-02-02 (@x) (@y)"
            );
            assert_eq!(clear_completion("b ~2024-01-01 ~2024-01-02"), "b");
        }

        #[test]
        fn restricted_scan_ignores_other_kinds() {
            let scan = scan("met vendor +2024-01-01 (@li)", &[AnnotationKind::Assignee]);
            assert_eq!(scan.text, "met vendor +2024-01-01");
            assert_eq!(scan.assignee(), Some("li"));
        }

        #[test]
        fn completion_set_and_clear_are_inverse() {
            let raw = "buy milk +2024-01-01";
            let done = set_completion(raw, date("2024-05-05"));
            assert_eq!(done, "buy milk +2024-01-01 ~2024-05-05");
            assert_eq!(clear_completion(&done), raw);

            let replaced = set_completion("x ~2024-01-01 (@a)", date("2024-02-02"));
            assert_eq!(replaced, "x ~2024-02-02 (@a)");
            assert_eq!(set_completion("", date("2024-02-02")), "~2024-02-02");
        }
    }
}

pub mod parser {
    //! Line classifier plus the two scanners built on it.
    //!
    //! Each line is classified into exactly one `LineKind`; sections, task blocks,
    //! task runs and archive entries are all found by walking those kinds.

    use crate::annotations::{self, AnnotationKind, PResult};
    use crate::core::*;
    use chrono::NaiveDate;
    use nom::{
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, one_of, space0},
        combinator::{map_opt, rest},
        error::{VerboseError, VerboseErrorKind},
    };

    pub const ARCHIVE_MARKER_PREFIX: &str = "_Archived on: ";
    pub const UPDATE_PREFIX: &str = "  - ";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineKind<'a> {
        Heading { level: u8, text: &'a str },
        Task { checkbox: Checkbox, raw: &'a str },
        Update { date: NaiveDate, raw: &'a str },
        ArchiveMarker { text: &'a str },
        Blank,
        Plain,
    }

    impl LineKind<'_> {
        pub fn heading_level(&self) -> Option<u8> {
            match self {
                LineKind::Heading { level, .. } => Some(*level),
                _ => None,
            }
        }

        pub fn is_task(&self) -> bool {
            matches!(self, LineKind::Task { .. })
        }
    }

    pub fn classify_line(line: &str) -> LineKind<'_> {
        if line.trim().is_empty() {
            return LineKind::Blank;
        }
        if let Ok((_, (level, text))) = heading_line(line) {
            return LineKind::Heading { level, text };
        }
        if let Ok((_, (checkbox, raw))) = task_line(line) {
            return LineKind::Task { checkbox, raw };
        }
        if let Ok((_, (date, raw))) = update_line(line) {
            return LineKind::Update { date, raw };
        }
        if let Some(text) = archive_marker(line) {
            return LineKind::ArchiveMarker { text };
        }
        LineKind::Plain
    }

    /// `#`, `##` or `###`, one space, non-empty text. Deeper levels are plain text.
    fn heading_line(i: &str) -> PResult<'_, (u8, &str)> {
        let (i, hashes) = take_while_m_n(1, 3, |c: char| c == '#')(i)?;
        let (i, _) = char(' ')(i)?;
        let (i, text) = rest(i)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("heading-text"))],
            }));
        }
        Ok((i, (hashes.len() as u8, text)))
    }

    fn task_line(i: &str) -> PResult<'_, (Checkbox, &str)> {
        let (i, _) = tag("- [")(i)?;
        let (i, checkbox) = map_opt(one_of(" xX!"), Checkbox::from_marker)(i)?;
        let (i, _) = tag("] ")(i)?;
        Ok(("", (checkbox, i)))
    }

    fn update_line(i: &str) -> PResult<'_, (NaiveDate, &str)> {
        let (i, _) = tag(UPDATE_PREFIX)(i)?;
        let (i, date) = annotations::parse_date(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = space0(i)?;
        Ok(("", (date, i)))
    }

    fn archive_marker(line: &str) -> Option<&str> {
        line.trim_end()
            .strip_prefix(ARCHIVE_MARKER_PREFIX)?
            .strip_suffix('_')
    }

    /* ------------------------------ Sections ------------------------------ */

    /// Split a document at its heading lines. Sections are contiguous, ordered,
    /// and cover every line; content before the first heading is a headless
    /// preamble section. A document with no lines has no sections.
    pub fn parse_sections(doc: &Document) -> Vec<Section> {
        let lines = doc.lines();
        if lines.is_empty() {
            return Vec::new();
        }
        let headings: Vec<Heading> = lines
            .iter()
            .enumerate()
            .filter_map(|(n, line)| match classify_line(line) {
                LineKind::Heading { level, text } => Some(Heading::new(level, text, n)),
                _ => None,
            })
            .collect();

        let mut sections = Vec::with_capacity(headings.len() + 1);
        let first = headings.first().map_or(lines.len(), |h| h.line);
        if first > 0 {
            sections.push(Section::new(doc, LineRange::new(0, first - 1), None));
        }
        for (idx, heading) in headings.iter().enumerate() {
            let next = headings.get(idx + 1).map_or(lines.len(), |h| h.line);
            sections.push(Section::new(
                doc,
                LineRange::new(heading.line, next - 1),
                Some(heading.clone()),
            ));
        }
        sections
    }

    pub fn parse_sections_str(text: &str) -> Vec<Section> {
        parse_sections(&Document::from_text(text))
    }

    /* -------------------------------- Tasks -------------------------------- */

    /// Extract the tasks in `lines`, whose first line sits at absolute `offset`.
    /// Heading context is left empty; the partitioner fills it in.
    pub fn extract_tasks<S: AsRef<str>>(lines: &[S], offset: usize) -> Vec<Task> {
        let mut tasks = Vec::new();
        let mut idx = 0;
        while idx < lines.len() {
            let LineKind::Task { checkbox, raw } = classify_line(lines[idx].as_ref()) else {
                idx += 1;
                continue;
            };
            let end = task_block_end(lines, idx);
            let updates = (idx + 1..=end)
                .filter_map(|n| match classify_line(lines[n].as_ref()) {
                    LineKind::Update { date, raw } => Some(update_from_line(offset + n, date, raw)),
                    _ => None,
                })
                .collect();
            tasks.push(task_from_line(offset + idx, checkbox, raw, updates, offset + end));
            idx = end + 1;
        }
        tasks
    }

    /// Index of the last line of the task block whose task line is `start`.
    ///
    /// Blank lines are skipped while looking for further updates but never end
    /// the block themselves; any other line does.
    pub fn task_block_end<S: AsRef<str>>(lines: &[S], start: usize) -> usize {
        let mut end = start;
        for (idx, line) in lines.iter().enumerate().skip(start + 1) {
            match classify_line(line.as_ref()) {
                LineKind::Update { .. } => end = idx,
                LineKind::Blank => {}
                _ => break,
            }
        }
        end
    }

    fn task_from_line(
        line_index: usize,
        checkbox: Checkbox,
        raw: &str,
        updates: Vec<TaskUpdate>,
        block_end_line: usize,
    ) -> Task {
        let scan = annotations::scan(raw, &AnnotationKind::ALL);
        Task {
            line_index,
            completed: checkbox == Checkbox::Done,
            pinned: checkbox == Checkbox::Pinned,
            assignee_alias: scan.assignee().map(str::to_string),
            creation_date: scan.date(AnnotationKind::Created),
            completion_date: scan.date(AnnotationKind::Completion),
            due_date: scan.date(AnnotationKind::Due),
            cost: scan.cost().cloned(),
            text: scan.text,
            updates,
            block_end_line,
            heading_hierarchy: vec![],
            project_title: None,
        }
    }

    fn update_from_line(line_index: usize, date: NaiveDate, raw: &str) -> TaskUpdate {
        let scan = annotations::scan(raw, &[AnnotationKind::Assignee]);
        TaskUpdate {
            line_index,
            date,
            assignee_alias: scan.assignee().map(str::to_string),
            text: scan.text,
        }
    }

}

pub mod projects {
    //! Derived view of a document: sections, projects and loose tasks.
    //! Rebuilt from scratch after every commit; never patched.

    use crate::core::*;
    use crate::parser::{extract_tasks, parse_sections};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DocumentView {
        /// Revision of the document this view was derived from.
        pub revision: u64,
        pub sections: Vec<Section>,
        pub projects: Vec<Project>,
        /// Tasks outside every level-1 heading.
        #[serde(default)]
        pub loose_tasks: Vec<Task>,
    }

    impl DocumentView {
        pub fn build(doc: &Document, revision: u64) -> Self {
            let sections = parse_sections(doc);
            let (projects, loose_tasks) = partition_projects(doc, &sections);
            Self {
                revision,
                sections,
                projects,
                loose_tasks,
            }
        }

        pub fn project_at(&self, line: Absolute) -> Option<&Project> {
            self.projects.iter().find(|p| p.contains(line.0))
        }

        pub fn project_titled(&self, title: &str) -> Option<&Project> {
            self.projects.iter().find(|p| p.title == title)
        }

        pub fn section_at(&self, line: Absolute) -> Option<&Section> {
            self.sections.iter().find(|s| s.range().contains(line.0))
        }

        /// The task whose task line is exactly `line`.
        pub fn task_at(&self, line: Absolute) -> Option<&Task> {
            self.tasks().into_iter().find(|t| t.line_index == line.0)
        }

        /// Every task in document order.
        pub fn tasks(&self) -> Vec<&Task> {
            let mut all: Vec<&Task> = self
                .projects
                .iter()
                .flat_map(|p| p.tasks())
                .chain(self.loose_tasks.iter())
                .collect();
            all.sort_by_key(|t| t.line_index);
            all
        }
    }

    /// Group sections into level-1 projects and attach every task to its
    /// project (or to the loose list), with heading context filled in.
    pub fn partition_projects(doc: &Document, sections: &[Section]) -> (Vec<Project>, Vec<Task>) {
        let mut projects: Vec<Project> = Vec::new();
        let mut loose = Vec::new();
        let mut stack: Vec<(u8, String)> = Vec::new();

        for section in sections {
            if let Some(heading) = &section.heading {
                while stack.last().is_some_and(|(level, _)| *level >= heading.level) {
                    stack.pop();
                }
                stack.push((heading.level, heading.text.clone()));
                if heading.level == 1 {
                    projects.push(Project::new(heading));
                } else if let Some(project) = projects.last_mut() {
                    project.headings.push(heading.clone());
                }
            }
            let in_project = stack.first().is_some_and(|(level, _)| *level == 1);
            if let Some(project) = projects.last_mut().filter(|_| in_project) {
                project.end_line = section.end_line;
            }

            let hierarchy: Vec<String> = stack.iter().map(|(_, text)| text.clone()).collect();
            let lines = &doc.lines()[section.start_line..=section.end_line];
            for mut task in extract_tasks(lines, section.start_line) {
                task.heading_hierarchy = hierarchy.clone();
                match projects.last_mut().filter(|_| in_project) {
                    Some(project) => {
                        task.project_title = Some(project.title.clone());
                        project.push_task(task);
                    }
                    None => loose.push(task),
                }
            }
        }
        (projects, loose)
    }

}

pub mod format {
    //! Rendering of task and update lines from structured fields.

    use crate::annotations::Annotation;
    use crate::core::*;
    use crate::parser::UPDATE_PREFIX;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    /// Editable fields of a task block.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TaskDraft {
        pub checkbox: Checkbox,
        pub text: String,
        pub created: Option<NaiveDate>,
        pub assignee: Option<String>,
        pub due: Option<NaiveDate>,
        pub cost: Option<Cost>,
        pub completed_on: Option<NaiveDate>,
        #[serde(default)]
        pub updates: Vec<UpdateDraft>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UpdateDraft {
        pub date: NaiveDate,
        pub text: String,
        pub assignee: Option<String>,
    }

    impl From<&TaskUpdate> for UpdateDraft {
        fn from(update: &TaskUpdate) -> Self {
            Self {
                date: update.date,
                text: update.text.clone(),
                assignee: update.assignee_alias.clone(),
            }
        }
    }

    impl From<&Task> for TaskDraft {
        fn from(task: &Task) -> Self {
            Self {
                checkbox: task.checkbox(),
                text: task.text.clone(),
                created: task.creation_date,
                assignee: task.assignee_alias.clone(),
                due: task.due_date,
                cost: task.cost.clone(),
                completed_on: task.completion_date,
                updates: task.updates.iter().map(UpdateDraft::from).collect(),
            }
        }
    }

    /// `- [m] text +created (@alias) !due ($cost) ~done`
    pub fn render_task_line(draft: &TaskDraft) -> String {
        let mut line = format!("- [{}] {}", draft.checkbox.marker(), draft.text);
        let tokens = [
            draft.created.map(Annotation::Created),
            draft.assignee.clone().map(Annotation::Assignee),
            draft.due.map(Annotation::Due),
            draft.cost.clone().map(Annotation::Cost),
            draft.completed_on.map(Annotation::Completion),
        ];
        for token in tokens.into_iter().flatten() {
            push_token(&mut line, &token.render());
        }
        line
    }

    /// `  - date: text (@alias)`
    pub fn render_update_line(update: &UpdateDraft) -> String {
        let mut line = format!("{UPDATE_PREFIX}{}: {}", update.date, update.text);
        if let Some(alias) = &update.assignee {
            push_token(&mut line, &Annotation::Assignee(alias.clone()).render());
        }
        line
    }

    /// Task line followed by its update lines.
    pub fn render_task_block(draft: &TaskDraft) -> Vec<String> {
        std::iter::once(render_task_line(draft))
            .chain(draft.updates.iter().map(render_update_line))
            .collect()
    }

    fn push_token(line: &mut String, token: &str) {
        if !line.ends_with(' ') {
            line.push(' ');
        }
        line.push_str(token);
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::extract_tasks;
        use pretty_assertions::assert_eq;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("date")
        }

        #[test]
        fn renders_annotations_in_canonical_order() {
            let draft = TaskDraft {
                checkbox: Checkbox::Done,
                text: "order parts".into(),
                created: Some(date(2024, 1, 1)),
                assignee: Some("kim".into()),
                due: Some(date(2024, 1, 9)),
                cost: Cost::parse("40.5"),
                completed_on: Some(date(2024, 1, 8)),
                updates: vec![],
            };
            assert_eq!(
                render_task_line(&draft),
                "- [x] order parts +2024-01-01 (@kim) !2024-01-09 ($40.5) ~2024-01-08"
            );
        }

        #[test]
        fn rendered_block_parses_back_to_the_same_fields() {
            let draft = TaskDraft {
                checkbox: Checkbox::Pinned,
                text: "hire designer".into(),
                assignee: Some("lee".into()),
                due: Some(date(2024, 6, 1)),
                updates: vec![
                    UpdateDraft {
                        date: date(2024, 5, 1),
                        text: "posted listing".into(),
                        assignee: None,
                    },
                    UpdateDraft {
                        date: date(2024, 5, 3),
                        text: "first interview".into(),
                        assignee: Some("lee".into()),
                    },
                ],
                ..TaskDraft::default()
            };
            let block = render_task_block(&draft);
            assert_eq!(
                block,
                vec![
                    "- [!] hire designer (@lee) !2024-06-01",
                    "  - 2024-05-01: posted listing",
                    "  - 2024-05-03: first interview (@lee)",
                ]
            );
            let tasks = extract_tasks(block.as_slice(), 0);
            assert_eq!(tasks.len(), 1);
            assert_eq!(TaskDraft::from(&tasks[0]), draft);
        }
    }
}

pub mod agenda {
    //! Read-model for due-date views, projected from parsed tasks.

    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    /// Denormalised slice of an open task with a due date.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaItem {
        pub line_index: usize,
        pub due: NaiveDate,
        pub overdue: bool,
        pub text: String,
        pub assignee_alias: Option<String>,
        pub project_title: Option<String>,
        pub context_path: Vec<String>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaRange {
        pub from: NaiveDate,
        pub to: NaiveDate, // inclusive
    }

    impl AgendaRange {
        pub fn contains(&self, date: NaiveDate) -> bool {
            date >= self.from && date <= self.to
        }
    }
}

pub mod archive {
    //! Layout of the archive document.
    //!
    //! ```text
    //! _Archived on: 2024-01-01_      entries without a project come first
    //! - [x] loose task
    //! # Website                      group heading, one per project title
    //! _Archived on: 2024-02-01_
    //! ## Launch checklist
    //! ...
    //! _Archived on: 2024-03-01_      a whole project keeps its own heading
    //! # Old project
    //! ```
    //!
    //! An entry is a marker line followed by its block, which runs to the next
    //! marker, the next level-1 heading, or the end of the document.

    use crate::core::*;
    use crate::parser::{ARCHIVE_MARKER_PREFIX, LineKind, classify_line};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    pub fn marker_line(date: NaiveDate) -> String {
        format!("{ARCHIVE_MARKER_PREFIX}{date}_")
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ArchiveEntry {
        pub marker_line: usize,
        /// Marker text as written; normally an ISO date.
        pub archived_on: String,
        pub project_title: Option<String>,
        /// The archived block, marker excluded.
        pub range: LineRange,
    }

    /// A block removed from the archive, ready to go back into the active document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TakenEntry {
        pub lines: Vec<String>,
        pub project_title: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ArchiveStore {
        doc: Document,
    }

    impl ArchiveStore {
        pub fn new(doc: Document) -> Self {
            Self { doc }
        }

        pub fn document(&self) -> &Document {
            &self.doc
        }

        pub fn into_document(self) -> Document {
            self.doc
        }

        pub fn entries(&self) -> Vec<ArchiveEntry> {
            let lines = self.doc.lines();
            let mut out = Vec::new();
            let mut group: Option<String> = None;
            for (idx, line) in lines.iter().enumerate() {
                match classify_line(line) {
                    LineKind::Heading { level: 1, text } => {
                        group = (!is_marker_at(&self.doc, idx.wrapping_sub(1)))
                            .then(|| text.to_string());
                    }
                    LineKind::ArchiveMarker { text } if idx + 1 < lines.len() => {
                        let start = idx + 1;
                        out.push(ArchiveEntry {
                            marker_line: idx,
                            archived_on: text.to_string(),
                            project_title: if is_h1_at(&self.doc, start) {
                                None
                            } else {
                                group.clone()
                            },
                            range: LineRange::new(start, entry_end(&self.doc, start)),
                        });
                    }
                    _ => {}
                }
            }
            out
        }

        /// Append `block` under its project group, returning the new store and
        /// the block's range inside it.
        pub fn append<S: AsRef<str>>(
            &self,
            project: Option<&str>,
            block: &[S],
            date: NaiveDate,
        ) -> (ArchiveStore, LineRange) {
            let mut lines = vec![marker_line(date)];
            lines.extend(block.iter().map(|l| l.as_ref().to_string()));

            let whole_project = block
                .first()
                .is_some_and(|l| classify_line(l.as_ref()).heading_level() == Some(1));
            let (at, skip) = match project {
                _ if whole_project => (self.doc.len(), 1),
                None => (first_group_line(&self.doc), 1),
                Some(title) => match self.group_heading(title) {
                    Some(heading) => (group_end(&self.doc, heading), 1),
                    None => {
                        lines.insert(0, format!("# {title}"));
                        (self.doc.len(), 2)
                    }
                },
            };
            let range = LineRange::new(at + skip, at + lines.len() - 1);
            (Self::new(self.doc.splice(at, 0, &lines)), range)
        }

        /// Remove the entry whose block is exactly `range`, with its marker.
        /// A project group left empty loses its heading too.
        pub fn take(&self, range: LineRange) -> EngineResult<(ArchiveStore, TakenEntry)> {
            let not_found = EngineError::SectionNotFound {
                start: range.start,
                end: range.end,
            };
            self.doc.check_range(range).map_err(|_| not_found.clone())?;
            let entry = self
                .entries()
                .into_iter()
                .find(|e| e.range == range)
                .ok_or(not_found)?;

            let lines = self.doc.block(range)?.to_vec();
            let mut doc = self.doc.remove(entry.marker_line, range.line_count() + 1);

            if let Some(title) = &entry.project_title {
                let heading = Self::new(doc.clone()).group_heading(title);
                if let Some(heading) = heading {
                    let end = group_end(&doc, heading);
                    let empty = doc.lines()[heading + 1..end]
                        .iter()
                        .all(|l| l.trim().is_empty());
                    if empty {
                        doc = doc.remove(heading, end - heading);
                    }
                }
            }

            Ok((
                Self::new(doc),
                TakenEntry {
                    lines,
                    project_title: entry.project_title,
                },
            ))
        }

        fn group_heading(&self, title: &str) -> Option<usize> {
            (0..self.doc.len()).find(|&idx| {
                matches!(
                    self.doc.line(idx).map(classify_line),
                    Some(LineKind::Heading { level: 1, text }) if text == title
                ) && !is_marker_at(&self.doc, idx.wrapping_sub(1))
            })
        }
    }

    fn is_marker_at(doc: &Document, idx: usize) -> bool {
        doc.line(idx)
            .is_some_and(|l| matches!(classify_line(l), LineKind::ArchiveMarker { .. }))
    }

    fn is_h1_at(doc: &Document, idx: usize) -> bool {
        doc.line(idx)
            .is_some_and(|l| classify_line(l).heading_level() == Some(1))
    }

    /// First line of the next top-level unit after `from`: a group heading, or
    /// the marker in front of an archived whole project.
    fn next_top_level(doc: &Document, from: usize) -> usize {
        (from..doc.len())
            .find(|&idx| is_h1_at(doc, idx))
            .map(|idx| {
                if idx > from && is_marker_at(doc, idx - 1) {
                    idx - 1
                } else {
                    idx
                }
            })
            .unwrap_or(doc.len())
    }

    fn first_group_line(doc: &Document) -> usize {
        next_top_level(doc, 0)
    }

    fn group_end(doc: &Document, heading: usize) -> usize {
        next_top_level(doc, heading + 1)
    }

    fn entry_end(doc: &Document, start: usize) -> usize {
        (start + 1..doc.len())
            .find(|&idx| is_h1_at(doc, idx) || is_marker_at(doc, idx))
            .map_or(doc.len() - 1, |idx| idx - 1)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn day(d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, d).expect("date")
        }

        #[test]
        fn appends_group_entries_and_projects_in_their_places() {
            let store = ArchiveStore::default();
            let (store, a) = store.append(Some("Web"), &["## Launch", "- [x] ship"], day(1));
            let (store, b) = store.append(None, &["- [x] loose"], day(2));
            let (store, c) = store.append(Some("Ops"), &["- [x] backup"], day(3));
            let (store, d) = store.append(Some("Web"), &["- [x] polish"], day(4));
            let (store, e) = store.append(Some("Old"), &["# Old", "- [x] all"], day(5));

            assert_eq!(
                store.document().to_text(),
                "_Archived on: 2024-03-02_\n- [x] loose\n# Web\n_Archived on: 2024-03-01_\n## Launch\n- [x] ship\n_Archived on: 2024-03-04_\n- [x] polish\n# Ops\n_Archived on: 2024-03-03_\n- [x] backup\n_Archived on: 2024-03-05_\n# Old\n- [x] all\n"
            );
            assert_eq!(a, LineRange::new(2, 3));
            assert_eq!(b, LineRange::new(1, 1));
            assert_eq!(c, LineRange::new(8, 8));
            assert_eq!(d, LineRange::new(7, 7));
            assert_eq!(e, LineRange::new(12, 13));

            let titles: Vec<Option<String>> =
                store.entries().into_iter().map(|e| e.project_title).collect();
            assert_eq!(
                titles,
                vec![None, Some("Web".into()), Some("Web".into()), Some("Ops".into()), None]
            );
        }

        #[test]
        fn grouped_entry_is_inserted_before_an_archived_project() {
            let (store, _) = ArchiveStore::default().append(Some("Web"), &["- [x] a"], day(1));
            let (store, _) = store.append(Some("Old"), &["# Old", "body"], day(2));
            let (store, range) = store.append(Some("Web"), &["- [x] b"], day(3));
            assert_eq!(range, LineRange::new(4, 4));
            assert_eq!(
                &store.document().lines()[5..],
                ["_Archived on: 2024-03-02_", "# Old", "body"]
            );
        }

        #[test]
        fn take_removes_marker_and_empty_group() {
            let (store, a) = ArchiveStore::default().append(
                Some("Web"),
                &["- [x] a", "  - 2024-03-01: done"],
                day(1),
            );
            let (store, b) = store.append(Some("Web"), &["- [x] b"], day(2));

            let (store, taken) = store.take(b).expect("take b");
            assert_eq!(taken.lines, vec!["- [x] b"]);
            assert_eq!(taken.project_title.as_deref(), Some("Web"));
            assert_eq!(store.entries().len(), 1);

            let (store, taken) = store.take(a).expect("take a");
            assert_eq!(taken.lines.len(), 2);
            assert_eq!(store.document().to_text(), "");
        }

        #[test]
        fn take_rejects_ranges_that_are_not_entries() {
            let (store, range) = ArchiveStore::default().append(None, &["x", "y"], day(1));
            assert_eq!(range, LineRange::new(1, 2));
            for bad in [
                LineRange::new(1, 1),
                LineRange::new(0, 2),
                LineRange::new(2, 2),
                LineRange::new(1, 9),
            ] {
                assert_eq!(
                    store.take(bad).map(|_| ()),
                    Err(EngineError::SectionNotFound {
                        start: bad.start,
                        end: bad.end
                    })
                );
            }
        }
    }
}

pub mod engine {
    //! Structural edits. Every operation is a pure function from the current
    //! document(s) to new ones; on error nothing is produced, so neither
    //! document can change.

    use crate::annotations::{clear_completion, set_completion};
    use crate::archive::ArchiveStore;
    use crate::core::*;
    use crate::parser::{LineKind, classify_line, extract_tasks};
    use crate::projects::DocumentView;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Direction {
        Up,
        Down,
        Top,
        Bottom,
    }

    /// Result of moving blocks from the active document into the archive.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Archived {
        pub active: Document,
        pub archive: Document,
        /// Where each archived block now sits in the archive, for restore.
        pub entries: Vec<LineRange>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Restored {
        pub active: Document,
        pub archive: Document,
        /// Where the block landed in the active document.
        pub range: LineRange,
    }

    /* ------------------------------ Sections ------------------------------ */

    /// Replace `range` with `content` split on newlines.
    pub fn update_section(doc: &Document, range: LineRange, content: &str) -> EngineResult<Document> {
        doc.check_range(range)?;
        Ok(doc.splice(range.start, range.line_count(), &split_lines(content)))
    }

    /// Insert `content` before line `at` (`at == len` appends).
    pub fn insert_section(doc: &Document, at: Absolute, content: &str) -> EngineResult<Document> {
        doc.check_insertion_point(at)?;
        Ok(doc.splice(at.0, 0, &split_lines(content)))
    }

    /// Relocate `range` so it ends up immediately before the original line
    /// `destination`.
    pub fn move_section(
        doc: &Document,
        range: LineRange,
        destination: Absolute,
    ) -> EngineResult<Document> {
        doc.check_range(range)?;
        doc.check_insertion_point(destination)?;
        if range.contains(destination.0) {
            return Err(EngineError::SectionOverlap {
                destination: destination.0,
                start: range.start,
                end: range.end,
            });
        }
        let block = doc.block(range)?;
        let at = if destination.0 > range.end {
            destination.0 - range.line_count()
        } else {
            destination.0
        };
        Ok(doc.remove(range.start, range.line_count()).splice(at, 0, block))
    }

    /// Insert a copy of `range` before `destination`, addressed in the
    /// original document.
    pub fn duplicate_section(
        doc: &Document,
        range: LineRange,
        destination: Absolute,
    ) -> EngineResult<Document> {
        doc.check_range(range)?;
        doc.check_insertion_point(destination)?;
        if destination.0 > range.start && destination.0 <= range.end {
            return Err(EngineError::SectionOverlap {
                destination: destination.0,
                start: range.start,
                end: range.end,
            });
        }
        Ok(doc.splice(destination.0, 0, doc.block(range)?))
    }

    /* -------------------------------- Tasks -------------------------------- */

    /// Set the task at `line` to `completed`. Completing stamps `~today`
    /// (replacing an existing stamp); reopening removes it. Only the task line
    /// changes.
    pub fn toggle_task(
        doc: &Document,
        line: Absolute,
        completed: bool,
        today: NaiveDate,
    ) -> EngineResult<Document> {
        let (checkbox, raw) = expect_task(doc, line)?;
        let (checkbox, raw) = if completed {
            (Checkbox::Done, set_completion(&raw, today))
        } else {
            let reopened = match checkbox {
                Checkbox::Pinned => Checkbox::Pinned,
                _ => Checkbox::Open,
            };
            (reopened, clear_completion(&raw))
        };
        Ok(doc.splice(line.0, 1, &[format!("- [{}] {raw}", checkbox.marker())]))
    }

    /// Replace the `count` lines starting at the task line `start` with `content`.
    pub fn update_task_block(
        doc: &Document,
        start: Absolute,
        count: usize,
        content: &str,
    ) -> EngineResult<Document> {
        expect_task(doc, start)?;
        doc.check_range(LineRange::new(start.0, start.0 + count.max(1) - 1))?;
        Ok(doc.splice(start.0, count, &split_lines(content)))
    }

    /// Move the block of the task at `line` within its run of adjacent task
    /// blocks. Moving past either end of the run is a no-op.
    pub fn reorder_task(doc: &Document, line: Absolute, direction: Direction) -> EngineResult<Document> {
        expect_task(doc, line)?;
        let runs = task_runs(doc);
        let (run, index) = runs
            .iter()
            .find_map(|run| {
                run.iter()
                    .position(|block| block.start == line.0)
                    .map(|idx| (run, idx))
            })
            .ok_or(EngineError::TaskNotFound { line: line.0 })?;

        let last = run.len() - 1;
        let target = match direction {
            Direction::Up => index.saturating_sub(1),
            Direction::Down => (index + 1).min(last),
            Direction::Top => 0,
            Direction::Bottom => last,
        };
        if target == index {
            return Ok(doc.clone());
        }

        let mut order: Vec<LineRange> = run.clone();
        let moved = order.remove(index);
        order.insert(target, moved);
        let span = LineRange::new(run[0].start, run[last].end);
        let lines: Vec<&String> = order
            .iter()
            .flat_map(|block| &doc.lines()[block.start..=block.end])
            .collect();
        Ok(doc.splice(span.start, span.line_count(), &lines))
    }

    /// Task blocks grouped into runs. Blocks in a run are directly adjacent;
    /// any other line, including a blank one, ends the run.
    pub fn task_runs(doc: &Document) -> Vec<Vec<LineRange>> {
        let mut runs: Vec<Vec<LineRange>> = Vec::new();
        for task in extract_tasks(doc.lines(), 0) {
            let block = task.block();
            match runs.last_mut() {
                Some(run) if run.last().is_some_and(|prev| prev.end + 1 == block.start) => {
                    run.push(block)
                }
                _ => runs.push(vec![block]),
            }
        }
        runs
    }

    fn expect_task(doc: &Document, line: Absolute) -> EngineResult<(Checkbox, String)> {
        match doc.line(line.0).map(classify_line) {
            Some(LineKind::Task { checkbox, raw }) => Ok((checkbox, raw.to_string())),
            _ => Err(EngineError::TaskNotFound { line: line.0 }),
        }
    }

    /* ------------------------------- Archive ------------------------------- */

    /// Move `range` out of `active` into the archive under `project`.
    ///
    /// The block may start with a level-1 heading but must not contain one
    /// further down, nor an archive marker anywhere: either would split it
    /// into several archive entries.
    pub fn archive_section(
        active: &Document,
        archive: &Document,
        range: LineRange,
        project: Option<&str>,
        today: NaiveDate,
    ) -> EngineResult<Archived> {
        let block = active.block(range)?;
        let splits = block.iter().enumerate().any(|(idx, line)| match classify_line(line) {
            LineKind::ArchiveMarker { .. } => true,
            LineKind::Heading { level: 1, .. } => idx > 0,
            _ => false,
        });
        if splits {
            return Err(EngineError::RangeInvalid {
                start: range.start,
                end: range.end,
                len: active.len(),
            });
        }
        let (store, entry) = ArchiveStore::new(archive.clone()).append(project, block, today);
        Ok(Archived {
            active: active.remove(range.start, range.line_count()),
            archive: store.into_document(),
            entries: vec![entry],
        })
    }

    /// Take the archive entry at `range` and put it back at the end of its
    /// project in `active`, or at the end of `active` when the project is gone.
    pub fn restore_section(
        active: &Document,
        archive: &Document,
        range: LineRange,
    ) -> EngineResult<Restored> {
        let (store, taken) = ArchiveStore::new(archive.clone()).take(range)?;
        let at = project_insertion_point(active, taken.project_title.as_deref());
        Ok(Restored {
            active: active.splice(at, 0, &taken.lines),
            archive: store.into_document(),
            range: LineRange::new(at, at + taken.lines.len() - 1),
        })
    }

    /// Archive the full blocks of the tasks at `lines`, each under its own
    /// project. Blocks are removed bottom-up and appended in document order.
    pub fn archive_tasks(
        active: &Document,
        archive: &Document,
        lines: &[Absolute],
        today: NaiveDate,
    ) -> EngineResult<Archived> {
        let view = DocumentView::build(active, 0);
        let mut picked: Vec<&Task> = Vec::with_capacity(lines.len());
        for line in lines {
            let task = view
                .task_at(*line)
                .ok_or(EngineError::TaskNotFound { line: line.0 })?;
            if !picked.iter().any(|t| t.line_index == task.line_index) {
                picked.push(task);
            }
        }
        picked.sort_by_key(|t| t.line_index);

        let mut store = ArchiveStore::new(archive.clone());
        let mut entries: Vec<LineRange> = Vec::with_capacity(picked.len());
        for task in &picked {
            let before = store.document().len();
            let block = active.block(task.block())?;
            let (next, entry) = store.append(task.project_title.as_deref(), block, today);
            let inserted = next.document().len() - before;
            let inserted_at = entry.start + block.len() - inserted;
            for earlier in entries.iter_mut().filter(|e| e.start > inserted_at) {
                earlier.start += inserted;
                earlier.end += inserted;
            }
            entries.push(entry);
            store = next;
        }

        let mut remaining = active.clone();
        for task in picked.iter().rev() {
            let block = task.block();
            remaining = remaining.remove(block.start, block.line_count());
        }
        Ok(Archived {
            active: remaining,
            archive: store.into_document(),
            entries,
        })
    }

    fn project_insertion_point(doc: &Document, project: Option<&str>) -> usize {
        project
            .and_then(|title| DocumentView::build(doc, 0).project_titled(title).map(|p| p.end_line + 1))
            .unwrap_or(doc.len())
    }


    #[cfg(test)]
    mod properties {
        use super::*;
        use crate::parser::parse_sections;
        use proptest::prelude::*;
        use proptest::sample::Index;

        fn today() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 6, 1).expect("date")
        }

        fn line() -> impl Strategy<Value = String> {
            let suffix = prop_oneof![
                Just(""),
                Just(" (@bo)"),
                Just(" !2024-05-01"),
                Just(" +2024-01-01 (@al)"),
            ];
            prop_oneof![
                (1usize..=4, "[a-z]{1,6}")
                    .prop_map(|(level, title)| format!("{} {title}", "#".repeat(level))),
                ("[a-z]{1,8}", suffix).prop_map(|(text, suffix)| format!("- [ ] {text}{suffix}")),
                "[a-z]{1,8}".prop_map(|text| format!("- [x] {text} ~2024-01-02")),
                "[a-z]{1,8}".prop_map(|note| format!("  - 2024-05-01: {note}")),
                Just(String::new()),
                "[a-z]{1,8}( [a-z]{1,8})?",
            ]
        }

        fn document() -> impl Strategy<Value = String> {
            (prop::collection::vec(line(), 0..20), any::<bool>()).prop_map(|(lines, newline)| {
                let mut text = lines.join("\n");
                if newline && !lines.is_empty() {
                    text.push('\n');
                }
                text
            })
        }

        proptest! {
            #[test]
            fn sections_rebuild_the_document(text in document()) {
                let sections = parse_sections(&Document::from_text(&text));
                let mut rebuilt = sections
                    .iter()
                    .map(|s| s.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.ends_with('\n') {
                    rebuilt.push('\n');
                }
                prop_assert_eq!(rebuilt, text);
            }

            #[test]
            fn move_then_move_back_is_identity(text in document(), pick in any::<Index>(), dest in any::<Index>()) {
                let d = Document::from_text(&text);
                let sections = parse_sections(&d);
                prop_assume!(!sections.is_empty());
                let range = sections[pick.index(sections.len())].range();
                let destination = dest.index(d.len() + 1);
                prop_assume!(!range.contains(destination) && destination != range.end + 1);

                let moved = move_section(&d, range, Absolute(destination)).expect("move");
                let n = range.line_count();
                let (back_range, back_to) = if destination < range.start {
                    (LineRange::new(destination, destination + n - 1), range.end + 1)
                } else {
                    (LineRange::new(destination - n, destination - 1), range.start)
                };
                let back = move_section(&moved, back_range, Absolute(back_to)).expect("back");
                prop_assert_eq!(back, d);
            }

            #[test]
            fn duplicate_inserts_one_copy(text in document(), pick in any::<Index>(), dest in any::<Index>()) {
                let d = Document::from_text(&text);
                let sections = parse_sections(&d);
                prop_assume!(!sections.is_empty());
                let range = sections[pick.index(sections.len())].range();
                let destination = dest.index(d.len() + 1);
                prop_assume!(destination <= range.start || destination > range.end);

                let copied = duplicate_section(&d, range, Absolute(destination)).expect("duplicate");
                let n = range.line_count();
                prop_assert_eq!(copied.len(), d.len() + n);
                prop_assert_eq!(
                    copied.block(LineRange::new(destination, destination + n - 1)).expect("copy"),
                    d.block(range).expect("original")
                );
            }

            #[test]
            fn completing_then_reopening_restores_the_task(text in document(), pick in any::<Index>()) {
                let d = Document::from_text(&text);
                let open: Vec<usize> = d
                    .lines()
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.starts_with("- [ ] "))
                    .map(|(n, _)| n)
                    .collect();
                prop_assume!(!open.is_empty());
                let line = Absolute(open[pick.index(open.len())]);

                let done = toggle_task(&d, line, true, today()).expect("complete");
                prop_assert!(done.lines()[line.0].starts_with("- [x] "));
                prop_assert_eq!(done.len(), d.len());
                let reopened = toggle_task(&done, line, false, today()).expect("reopen");
                prop_assert_eq!(reopened, d);
            }
        }
    }
}

pub mod session {
    //! The single writer. All mutations go through `Session::apply`, which
    //! rejects edits computed against an older revision than the current one.

    use crate::archive::{ArchiveEntry, ArchiveStore};
    use crate::core::*;
    use crate::engine::{self, Direction};
    use crate::projects::DocumentView;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// Source of "today" for completion stamps and archive markers.
    pub trait Clock: fmt::Debug {
        fn today(&self) -> NaiveDate;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn today(&self) -> NaiveDate {
            chrono::Local::now().date_naive()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    /// One structural edit, addressed in the coordinates of a given revision.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "op", rename_all = "snake_case")]
    pub enum Mutation {
        UpdateSection {
            range: LineRange,
            content: String,
        },
        InsertSection {
            at: Absolute,
            content: String,
        },
        MoveSection {
            range: LineRange,
            destination: Absolute,
        },
        DuplicateSection {
            range: LineRange,
            destination: Absolute,
        },
        ToggleTask {
            line: Absolute,
            completed: bool,
        },
        UpdateTaskBlock {
            start: Absolute,
            count: usize,
            content: String,
        },
        ReorderTask {
            line: Absolute,
            direction: Direction,
        },
        ArchiveSection {
            range: LineRange,
            project: Option<String>,
        },
        RestoreSection {
            range: LineRange,
        },
        ArchiveTasks {
            lines: Vec<Absolute>,
        },
    }

    impl Mutation {
        pub fn name(&self) -> &'static str {
            match self {
                Mutation::UpdateSection { .. } => "update_section",
                Mutation::InsertSection { .. } => "insert_section",
                Mutation::MoveSection { .. } => "move_section",
                Mutation::DuplicateSection { .. } => "duplicate_section",
                Mutation::ToggleTask { .. } => "toggle_task",
                Mutation::UpdateTaskBlock { .. } => "update_task_block",
                Mutation::ReorderTask { .. } => "reorder_task",
                Mutation::ArchiveSection { .. } => "archive_section",
                Mutation::RestoreSection { .. } => "restore_section",
                Mutation::ArchiveTasks { .. } => "archive_tasks",
            }
        }
    }

    /// What a commit produced besides the new active document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        Edited,
        /// Archive coordinates of the newly archived blocks.
        Archived(Vec<LineRange>),
        /// Active-document range of the restored block.
        Restored(LineRange),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Commit {
        pub view: DocumentView,
        pub outcome: Outcome,
    }

    #[derive(Debug)]
    pub struct Session {
        active: Document,
        archive: Document,
        revision: u64,
        clock: Box<dyn Clock>,
    }

    impl Session {
        pub fn new(active: Document, archive: Document) -> Self {
            Self::with_clock(active, archive, SystemClock)
        }

        pub fn with_clock(active: Document, archive: Document, clock: impl Clock + 'static) -> Self {
            Self {
                active,
                archive,
                revision: 0,
                clock: Box::new(clock),
            }
        }

        pub fn revision(&self) -> u64 {
            self.revision
        }

        pub fn active(&self) -> &Document {
            &self.active
        }

        pub fn archive(&self) -> &Document {
            &self.archive
        }

        pub fn today(&self) -> NaiveDate {
            self.clock.today()
        }

        pub fn view(&self) -> DocumentView {
            DocumentView::build(&self.active, self.revision)
        }

        pub fn archive_view(&self) -> DocumentView {
            DocumentView::build(&self.archive, self.revision)
        }

        pub fn archive_entries(&self) -> Vec<ArchiveEntry> {
            ArchiveStore::new(self.archive.clone()).entries()
        }

        /// Apply `mutation`, computed against `revision`. On success both
        /// documents are replaced and the revision advances by one; on error
        /// nothing changes.
        pub fn apply(&mut self, revision: u64, mutation: Mutation) -> EngineResult<Commit> {
            let op = mutation.name();
            match self.compute(revision, mutation) {
                Ok((active, archive, outcome)) => {
                    self.active = active;
                    if let Some(archive) = archive {
                        self.archive = archive;
                    }
                    self.revision += 1;
                    tracing::debug!(op, revision = self.revision, lines = self.active.len(), "committed");
                    Ok(Commit {
                        view: self.view(),
                        outcome,
                    })
                }
                Err(err) => {
                    tracing::warn!(op, revision = self.revision, error = %err, "rejected");
                    Err(err)
                }
            }
        }

        fn compute(
            &self,
            revision: u64,
            mutation: Mutation,
        ) -> EngineResult<(Document, Option<Document>, Outcome)> {
            if revision != self.revision {
                return Err(EngineError::StaleRevision {
                    expected: revision,
                    actual: self.revision,
                });
            }
            let doc = &self.active;
            let edited = |active: Document| (active, None, Outcome::Edited);
            Ok(match mutation {
                Mutation::UpdateSection { range, content } => {
                    edited(engine::update_section(doc, range, &content)?)
                }
                Mutation::InsertSection { at, content } => {
                    edited(engine::insert_section(doc, at, &content)?)
                }
                Mutation::MoveSection { range, destination } => {
                    edited(engine::move_section(doc, range, destination)?)
                }
                Mutation::DuplicateSection { range, destination } => {
                    edited(engine::duplicate_section(doc, range, destination)?)
                }
                Mutation::ToggleTask { line, completed } => {
                    edited(engine::toggle_task(doc, line, completed, self.today())?)
                }
                Mutation::UpdateTaskBlock {
                    start,
                    count,
                    content,
                } => edited(engine::update_task_block(doc, start, count, &content)?),
                Mutation::ReorderTask { line, direction } => {
                    edited(engine::reorder_task(doc, line, direction)?)
                }
                Mutation::ArchiveSection { range, project } => {
                    let archived = engine::archive_section(
                        doc,
                        &self.archive,
                        range,
                        project.as_deref(),
                        self.today(),
                    )?;
                    (
                        archived.active,
                        Some(archived.archive),
                        Outcome::Archived(archived.entries),
                    )
                }
                Mutation::RestoreSection { range } => {
                    let restored = engine::restore_section(doc, &self.archive, range)?;
                    (
                        restored.active,
                        Some(restored.archive),
                        Outcome::Restored(restored.range),
                    )
                }
                Mutation::ArchiveTasks { lines } => {
                    let archived =
                        engine::archive_tasks(doc, &self.archive, &lines, self.today())?;
                    (
                        archived.active,
                        Some(archived.archive),
                        Outcome::Archived(archived.entries),
                    )
                }
            })
        }
    }

    /* ---------------------------- Section editor ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EditorState {
        Preview,
        Editing { buffer: String },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EditTarget {
        Existing(LineRange),
        /// A section that does not exist yet; saving inserts it here.
        Insert(Absolute),
    }

    /// Preview/Editing lifecycle of one editable section.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SectionEditor {
        target: EditTarget,
        state: EditorState,
    }

    impl SectionEditor {
        pub fn new(range: LineRange) -> Self {
            Self {
                target: EditTarget::Existing(range),
                state: EditorState::Preview,
            }
        }

        /// A fresh section starts out being edited.
        pub fn new_empty(at: Absolute) -> Self {
            Self {
                target: EditTarget::Insert(at),
                state: EditorState::Editing {
                    buffer: String::new(),
                },
            }
        }

        pub fn target(&self) -> EditTarget {
            self.target
        }

        pub fn state(&self) -> &EditorState {
            &self.state
        }

        pub fn is_editing(&self) -> bool {
            matches!(self.state, EditorState::Editing { .. })
        }

        /// Preview -> Editing, seeding the buffer with the section's current text.
        pub fn begin_edit(&mut self, session: &Session) -> EngineResult<()> {
            if self.is_editing() {
                return Ok(());
            }
            let buffer = match self.target {
                EditTarget::Existing(range) => session.active().block(range)?.join("\n"),
                EditTarget::Insert(_) => String::new(),
            };
            self.state = EditorState::Editing { buffer };
            Ok(())
        }

        /// Replace the buffer; ignored outside Editing.
        pub fn set_buffer(&mut self, text: impl Into<String>) {
            if let EditorState::Editing { buffer } = &mut self.state {
                *buffer = text.into();
            }
        }

        pub fn cancel(&mut self) {
            self.state = EditorState::Preview;
        }

        /// Commit the buffer and return to Preview. `Ok(None)` when not editing.
        /// A rejected save stays in Editing with the buffer intact.
        pub fn save(&mut self, session: &mut Session, revision: u64) -> EngineResult<Option<Commit>> {
            let EditorState::Editing { buffer } = &self.state else {
                return Ok(None);
            };
            let (mutation, start) = match self.target {
                EditTarget::Existing(range) => (
                    Mutation::UpdateSection {
                        range,
                        content: buffer.clone(),
                    },
                    range.start,
                ),
                EditTarget::Insert(at) => (
                    Mutation::InsertSection {
                        at,
                        content: buffer.clone(),
                    },
                    at.0,
                ),
            };
            let saved_lines = split_lines(buffer).len();
            let commit = session.apply(revision, mutation)?;
            self.target = EditTarget::Existing(LineRange::new(start, start + saved_lines - 1));
            self.state = EditorState::Preview;
            Ok(Some(commit))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn session(text: &str) -> Session {
            Session::with_clock(
                Document::from_text(text),
                Document::default(),
                FixedClock(NaiveDate::from_ymd_opt(2024, 7, 4).expect("date")),
            )
        }

        #[test]
        fn commits_advance_the_revision_and_return_a_fresh_view() {
            let mut s = session("# P\n- [ ] a\n- [ ] b\n");
            let commit = s
                .apply(
                    0,
                    Mutation::ToggleTask {
                        line: Absolute(2),
                        completed: true,
                    },
                )
                .expect("toggle");
            assert_eq!(s.revision(), 1);
            assert_eq!(commit.view.revision, 1);
            assert_eq!(commit.outcome, Outcome::Edited);
            let task = commit.view.task_at(Absolute(2)).expect("task");
            assert!(task.completed);
            assert_eq!(task.completion_date, NaiveDate::from_ymd_opt(2024, 7, 4));
        }

        #[test]
        fn second_edit_from_the_same_revision_is_rejected_unchanged() {
            let mut s = session("# A\na\n# B\nb\n");
            let view = s.view();
            let b = view.sections[1].range();
            s.apply(
                view.revision,
                Mutation::MoveSection {
                    range: b,
                    destination: Absolute(0),
                },
            )
            .expect("first");
            let before = s.active().clone();
            let err = s
                .apply(
                    view.revision,
                    Mutation::DuplicateSection {
                        range: b,
                        destination: Absolute(0),
                    },
                )
                .expect_err("stale");
            assert_eq!(err, EngineError::StaleRevision { expected: 0, actual: 1 });
            assert_eq!(s.active(), &before);
            assert_eq!(s.revision(), 1);
        }

        #[test]
        fn rejected_mutation_changes_neither_document() {
            let mut s = session("# A\n- [x] done\n");
            s.apply(
                0,
                Mutation::ArchiveSection {
                    range: LineRange::new(1, 1),
                    project: Some("A".into()),
                },
            )
            .expect("archive");
            let (active, archive) = (s.active().clone(), s.archive().clone());
            let err = s
                .apply(1, Mutation::RestoreSection { range: LineRange::new(0, 0) })
                .expect_err("not an entry");
            assert_eq!(err, EngineError::SectionNotFound { start: 0, end: 0 });
            assert_eq!((s.active(), s.archive()), (&active, &archive));
        }

        #[test]
        fn archive_and_restore_through_the_session() {
            let mut s = session("# A\n- [x] done\n- [ ] open\n");
            let commit = s
                .apply(0, Mutation::ArchiveTasks { lines: vec![Absolute(1)] })
                .expect("archive");
            let Outcome::Archived(entries) = commit.outcome else {
                panic!("expected archived outcome");
            };
            assert_eq!(s.archive().to_text(), "# A\n_Archived on: 2024-07-04_\n- [x] done\n");
            assert_eq!(s.archive_entries()[0].project_title.as_deref(), Some("A"));

            let commit = s
                .apply(1, Mutation::RestoreSection { range: entries[0] })
                .expect("restore");
            assert_eq!(commit.outcome, Outcome::Restored(LineRange::new(2, 2)));
            assert_eq!(s.active().to_text(), "# A\n- [ ] open\n- [x] done\n");
            assert!(s.archive().is_empty());
        }

        #[test]
        fn mutations_serialize_with_an_op_tag() {
            let json = serde_json::to_string(&Mutation::ReorderTask {
                line: Absolute(3),
                direction: Direction::Top,
            })
            .expect("json");
            assert_eq!(json, r#"{"op":"reorder_task","line":3,"direction":"top"}"#);
        }

        #[test]
        fn editor_saves_and_cancels() {
            let mut s = session("# A\nold\n# B\n");
            let mut editor = SectionEditor::new(LineRange::new(0, 1));
            assert_eq!(editor.state(), &EditorState::Preview);

            editor.begin_edit(&s).expect("edit");
            assert_eq!(
                editor.state(),
                &EditorState::Editing {
                    buffer: "# A\nold".into()
                }
            );
            editor.set_buffer("# A\nscrapped");
            editor.cancel();
            assert_eq!(editor.state(), &EditorState::Preview);
            assert_eq!(s.active().to_text(), "# A\nold\n# B\n");

            editor.begin_edit(&s).expect("edit");
            editor.set_buffer("# A\nnew\nmore");
            let commit = editor.save(&mut s, 0).expect("save").expect("commit");
            assert_eq!(commit.view.sections[0].content, "# A\nnew\nmore");
            assert_eq!(editor.target(), EditTarget::Existing(LineRange::new(0, 2)));
            assert!(!editor.is_editing());
            assert_eq!(editor.save(&mut s, 1).expect("idle"), None);
        }

        #[test]
        fn empty_editor_inserts_a_new_section() {
            let mut s = session("# A\n");
            let mut editor = SectionEditor::new_empty(Absolute(1));
            assert!(editor.is_editing());
            editor.set_buffer("# B\n- [ ] first");
            editor.save(&mut s, 0).expect("save");
            assert_eq!(s.active().to_text(), "# A\n# B\n- [ ] first\n");
            assert_eq!(editor.target(), EditTarget::Existing(LineRange::new(1, 2)));
        }

        #[test]
        fn failed_save_keeps_the_buffer() {
            let mut s = session("# A\n");
            let mut editor = SectionEditor::new_empty(Absolute(1));
            editor.set_buffer("draft");
            assert!(editor.save(&mut s, 5).is_err());
            assert!(editor.is_editing());
        }
    }
}

pub mod storage {
    //! Loading and saving the active document and its archive sibling.

    use crate::core::Document;
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::{Path, PathBuf};

    pub trait DocumentRepository {
        /// Load `(active, archive)`.
        fn load(&self) -> Result<(Document, Document)>;

        fn save(&self, active: &Document, archive: &Document) -> Result<()>;
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FsRepository {
        active_path: PathBuf,
        archive_path: PathBuf,
    }

    impl FsRepository {
        pub fn new(active_path: impl Into<PathBuf>, archive_suffix: &str) -> Self {
            let active_path = active_path.into();
            let archive_path = archive_path_for(&active_path, archive_suffix);
            Self {
                active_path,
                archive_path,
            }
        }

        pub fn active_path(&self) -> &Path {
            &self.active_path
        }

        pub fn archive_path(&self) -> &Path {
            &self.archive_path
        }
    }

    impl DocumentRepository for FsRepository {
        fn load(&self) -> Result<(Document, Document)> {
            let active = fs::read_to_string(&self.active_path)
                .with_context(|| format!("reading {:?}", self.active_path))?;
            let archive = if self.archive_path.exists() {
                fs::read_to_string(&self.archive_path)
                    .with_context(|| format!("reading {:?}", self.archive_path))?
            } else {
                String::new()
            };
            Ok((Document::from_text(&active), Document::from_text(&archive)))
        }

        /// The archive file is only created once it has content.
        fn save(&self, active: &Document, archive: &Document) -> Result<()> {
            fs::write(&self.active_path, active.to_text().as_bytes())
                .with_context(|| format!("writing {:?}", self.active_path))?;
            if !archive.is_empty() || self.archive_path.exists() {
                fs::write(&self.archive_path, archive.to_text().as_bytes())
                    .with_context(|| format!("writing {:?}", self.archive_path))?;
            }
            Ok(())
        }
    }

    /// `notes/plan.md` + `.archive` -> `notes/plan.archive.md`
    pub fn archive_path_for(path: &Path, suffix: &str) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
            None => format!("{stem}{suffix}"),
        };
        path.with_file_name(name)
    }

}

pub mod config {
    //! `mdtrack.toml`, looked up next to the document and then in the
    //! working directory. Every field is optional.

    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::fs;
    use std::path::{Path, PathBuf};

    pub const CONFIG_FILE_NAME: &str = "mdtrack.toml";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct Config {
        /// Inserted between the document's stem and extension to name the archive.
        pub archive_suffix: String,
        /// `EnvFilter` directives used when `RUST_LOG` is unset.
        pub log_filter: String,
        /// Pins "today", e.g. for reproducible runs.
        pub date: Option<NaiveDate>,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                archive_suffix: ".archive".to_string(),
                log_filter: "warn".to_string(),
                date: None,
            }
        }
    }

    impl Config {
        pub fn from_toml_str(text: &str) -> Result<Self> {
            toml::from_str(text).context("parsing configuration")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_toml_str(&text).with_context(|| format!("loading {:?}", path))
        }

        /// First config found beside `document`, then in the current
        /// directory; defaults when neither exists.
        pub fn discover(document: &Path) -> Result<Self> {
            let beside = document
                .parent()
                .map(|dir| dir.join(CONFIG_FILE_NAME));
            let cwd = std::env::current_dir().ok().map(|dir| dir.join(CONFIG_FILE_NAME));
            let found: Option<PathBuf> = beside.into_iter().chain(cwd).find(|p| p.is_file());
            match found {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "using configuration");
                    Self::load(&path)
                }
                None => Ok(Self::default()),
            }
        }
    }

}

pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Install the stderr subscriber. `RUST_LOG` wins over `default_filter`;
    /// a second call is a no-op.
    pub fn init(default_filter: &str) {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

pub mod projectors {
    pub mod agenda_projector {
        use crate::agenda::{AgendaItem, AgendaRange};
        use crate::core::*;
        use chrono::NaiveDate;

        /// Open tasks with a due date, sorted by due date then document order.
        /// `overdue` is relative to `today`.
        pub fn project_tasks<'a>(
            tasks: impl IntoIterator<Item = &'a Task>,
            range: Option<AgendaRange>,
            today: NaiveDate,
        ) -> Vec<AgendaItem> {
            let mut out: Vec<AgendaItem> = tasks
                .into_iter()
                .filter(|t| !t.completed)
                .filter_map(|t| t.due_date.map(|due| (t, due)))
                .filter(|(_, due)| range.is_none_or(|r| r.contains(*due)))
                .map(|(t, due)| AgendaItem {
                    line_index: t.line_index,
                    due,
                    overdue: due < today,
                    text: t.text.clone(),
                    assignee_alias: t.assignee_alias.clone(),
                    project_title: t.project_title.clone(),
                    context_path: t.heading_hierarchy.clone(),
                })
                .collect();
            out.sort_by_key(|item| (item.due, item.line_index));
            out
        }

        pub fn project_projects(
            projects: &[Project],
            range: Option<AgendaRange>,
            today: NaiveDate,
        ) -> Vec<AgendaItem> {
            project_tasks(projects.iter().flat_map(|p| p.tasks()), range, today)
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::projects::DocumentView;

            fn date(m: u32, d: u32) -> NaiveDate {
                NaiveDate::from_ymd_opt(2024, m, d).expect("date")
            }

            #[test]
            fn lists_open_due_tasks_in_date_order() {
                let doc = Document::from_text(
                    "# P\n- [ ] late !2024-03-01\n- [x] done !2024-01-01 ~2024-01-01\n- [ ] soon !2024-04-02 (@ana)\n- [ ] undated\n# Q\n- [ ] first !2024-02-10\n",
                );
                let view = DocumentView::build(&doc, 0);
                let items = project_projects(&view.projects, None, date(3, 15));
                let summary: Vec<(&str, bool)> =
                    items.iter().map(|i| (i.text.as_str(), i.overdue)).collect();
                assert_eq!(summary, vec![("first", true), ("late", true), ("soon", false)]);
                assert_eq!(items[2].assignee_alias.as_deref(), Some("ana"));
                assert_eq!(items[0].project_title.as_deref(), Some("Q"));

                let april = AgendaRange {
                    from: date(4, 1),
                    to: date(4, 30),
                };
                let items = project_tasks(view.tasks(), Some(april), date(3, 15));
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].line_index, 3);
            }
        }
    }
}

pub use crate::archive::{ArchiveEntry, ArchiveStore};
pub use crate::core::{Absolute, Document, EngineError, EngineResult, LineRange, RelativeToProject};
pub use crate::engine::Direction;
pub use crate::parser::{classify_line, parse_sections};
pub use crate::projects::DocumentView;
pub use crate::session::{Mutation, Session};
