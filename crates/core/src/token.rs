//! Token Provider (spec §4.1): a pure function from (entity level, bound
//! entities) to rendered strings. Deterministic — no clock reads beyond
//! what's embedded in the bound entities themselves.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};

use crate::entity::{Course, File, Folder, Level, Semester};

/// The closed set of template tokens (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    Path,
    ShortPath,
    Semester,
    SemesterId,
    SemesterLexical,
    SemesterLexicalShort,
    SemesterShort,
    Course,
    CourseAbbrev,
    CourseClass,
    CourseDescription,
    CourseGroup,
    CourseId,
    CourseLocation,
    CourseNumber,
    CourseSubtitle,
    CourseType,
    CourseTypeShort,
    FileDescription,
    FileDownloads,
    FileId,
    FileMimeType,
    FileName,
    FileSize,
    FileStorage,
    FileTerms,
}

impl Token {
    pub const ALL: [Token; 26] = [
        Token::Path,
        Token::ShortPath,
        Token::Semester,
        Token::SemesterId,
        Token::SemesterLexical,
        Token::SemesterLexicalShort,
        Token::SemesterShort,
        Token::Course,
        Token::CourseAbbrev,
        Token::CourseClass,
        Token::CourseDescription,
        Token::CourseGroup,
        Token::CourseId,
        Token::CourseLocation,
        Token::CourseNumber,
        Token::CourseSubtitle,
        Token::CourseType,
        Token::CourseTypeShort,
        Token::FileDescription,
        Token::FileDownloads,
        Token::FileId,
        Token::FileMimeType,
        Token::FileName,
        Token::FileSize,
        Token::FileStorage,
        Token::FileTerms,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Token::Path => "path",
            Token::ShortPath => "short-path",
            Token::Semester => "semester",
            Token::SemesterId => "semester-id",
            Token::SemesterLexical => "semester-lexical",
            Token::SemesterLexicalShort => "semester-lexical-short",
            Token::SemesterShort => "semester-short",
            Token::Course => "course",
            Token::CourseAbbrev => "course-abbrev",
            Token::CourseClass => "course-class",
            Token::CourseDescription => "course-description",
            Token::CourseGroup => "course-group",
            Token::CourseId => "course-id",
            Token::CourseLocation => "course-location",
            Token::CourseNumber => "course-number",
            Token::CourseSubtitle => "course-subtitle",
            Token::CourseType => "course-type",
            Token::CourseTypeShort => "course-type-short",
            Token::FileDescription => "file-description",
            Token::FileDownloads => "file-downloads",
            Token::FileId => "file-id",
            Token::FileMimeType => "file-mime-type",
            Token::FileName => "file-name",
            Token::FileSize => "file-size",
            Token::FileStorage => "file-storage",
            Token::FileTerms => "file-terms",
        }
    }

    /// Fixed level of this token (spec §3).
    pub fn level(self) -> Level {
        match self {
            Token::Path | Token::ShortPath => Level::Folder,
            Token::Semester
            | Token::SemesterId
            | Token::SemesterLexical
            | Token::SemesterLexicalShort
            | Token::SemesterShort => Level::Semester,
            Token::Course
            | Token::CourseAbbrev
            | Token::CourseClass
            | Token::CourseDescription
            | Token::CourseGroup
            | Token::CourseId
            | Token::CourseLocation
            | Token::CourseNumber
            | Token::CourseSubtitle
            | Token::CourseType
            | Token::CourseTypeShort => Level::Course,
            Token::FileDescription
            | Token::FileDownloads
            | Token::FileId
            | Token::FileMimeType
            | Token::FileName
            | Token::FileSize
            | Token::FileStorage
            | Token::FileTerms => Level::File,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Token {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Token::ALL.iter().copied().find(|t| t.as_str() == s).ok_or(())
    }
}

/// Partial mapping of levels to concrete entities fixed by ancestors
/// (spec §3 "bindings"). `folder_path` is the chain from the course's top
/// folder down to (and including) the immediate folder of context, used to
/// render `path`/`short-path`; it is empty until a folder has been bound.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub semester: Option<Semester>,
    pub course: Option<Course>,
    pub folder_path: Vec<Folder>,
    pub file: Option<File>,
}

impl Bindings {
    pub fn bound_through(&self) -> Option<Level> {
        if self.file.is_some() {
            Some(Level::File)
        } else if !self.folder_path.is_empty() {
            Some(Level::Folder)
        } else if self.course.is_some() {
            Some(Level::Course)
        } else if self.semester.is_some() {
            Some(Level::Semester)
        } else {
            None
        }
    }
}

/// Names treated as the course's "generic root" folder (spec §4.1
/// short-path rule). Configurable; this is the default set.
pub fn default_generic_roots() -> BTreeSet<String> {
    ["Hauptordner", "Allgemeiner Dateiordner"].iter().map(|s| s.to_string()).collect()
}

/// Render a single token against the given bindings. Missing attributes
/// render as the empty string (spec §4.1).
pub fn render(token: Token, bindings: &Bindings, generic_roots: &BTreeSet<String>) -> String {
    match token {
        Token::Path => render_path(&bindings.folder_path, &BTreeSet::new()),
        Token::ShortPath => render_path(&bindings.folder_path, generic_roots),
        Token::Semester => bindings.semester.as_ref().map(|s| s.title.clone()).unwrap_or_default(),
        Token::SemesterId => bindings.semester.as_ref().map(|s| s.id.clone()).unwrap_or_default(),
        Token::SemesterLexical => {
            bindings.semester.as_ref().map(|s| semester_lexical(s.begin)).unwrap_or_default()
        }
        Token::SemesterLexicalShort => bindings
            .semester
            .as_ref()
            .map(|s| semester_lexical_short(s.begin))
            .unwrap_or_default(),
        Token::SemesterShort => {
            bindings.semester.as_ref().map(|s| semester_short(&s.title)).unwrap_or_default()
        }
        Token::Course => bindings.course.as_ref().map(|c| c.title.clone()).unwrap_or_default(),
        Token::CourseAbbrev => {
            bindings.course.as_ref().map(|c| course_abbrev(&c.title)).unwrap_or_default()
        }
        Token::CourseClass => bindings.course.as_ref().map(|c| c.class.clone()).unwrap_or_default(),
        Token::CourseDescription => {
            bindings.course.as_ref().map(|c| c.description.clone()).unwrap_or_default()
        }
        Token::CourseGroup => bindings.course.as_ref().map(|c| c.group.clone()).unwrap_or_default(),
        Token::CourseId => bindings.course.as_ref().map(|c| c.id.clone()).unwrap_or_default(),
        Token::CourseLocation => {
            bindings.course.as_ref().map(|c| c.location.clone()).unwrap_or_default()
        }
        Token::CourseNumber => bindings.course.as_ref().map(|c| c.number.clone()).unwrap_or_default(),
        Token::CourseSubtitle => {
            bindings.course.as_ref().map(|c| c.subtitle.clone()).unwrap_or_default()
        }
        Token::CourseType => {
            bindings.course.as_ref().map(|c| c.course_type.clone()).unwrap_or_default()
        }
        Token::CourseTypeShort => {
            bindings.course.as_ref().map(|c| c.type_short.clone()).unwrap_or_default()
        }
        Token::FileDescription => {
            bindings.file.as_ref().map(|f| f.description.clone()).unwrap_or_default()
        }
        Token::FileDownloads => {
            bindings.file.as_ref().map(|f| f.downloads.to_string()).unwrap_or_default()
        }
        Token::FileId => bindings.file.as_ref().map(|f| f.id.clone()).unwrap_or_default(),
        Token::FileMimeType => {
            bindings.file.as_ref().map(|f| f.mime_type.clone()).unwrap_or_default()
        }
        Token::FileName => bindings.file.as_ref().map(|f| f.name.clone()).unwrap_or_default(),
        Token::FileSize => bindings.file.as_ref().map(|f| f.size.to_string()).unwrap_or_default(),
        Token::FileStorage => bindings.file.as_ref().map(|f| f.storage.clone()).unwrap_or_default(),
        Token::FileTerms => bindings.file.as_ref().map(|f| f.terms.clone()).unwrap_or_default(),
    }
}

/// All defined tokens rendered against `bindings`, for the
/// `studip-fuse.known-tokens` xattr (spec §6).
pub fn all_tokens(bindings: &Bindings, generic_roots: &BTreeSet<String>) -> Vec<(&'static str, String)> {
    Token::ALL.iter().map(|&t| (t.as_str(), render(t, bindings, generic_roots))).collect()
}

fn render_path(folder_path: &[Folder], generic_roots: &BTreeSet<String>) -> String {
    // Open Question (spec §9): strip only the outermost generic-root
    // component, not repeatedly.
    let mut names: Vec<&str> = folder_path.iter().map(|f| f.name.as_str()).collect();
    if let Some(first) = names.first() {
        if generic_roots.contains(*first) {
            names.remove(0);
        }
    }
    names.join("/")
}

/// `SS` spans Apr–Sep, `WS` spans Oct–Mar. A WS beginning in Jan–Mar
/// belongs to the WS that started the previous calendar year.
fn lexical_year_and_season(begin: DateTime<Utc>) -> (i32, &'static str) {
    let month = begin.month();
    let year = begin.year();
    match month {
        4..=9 => (year, "SS"),
        10..=12 => (year, "WS"),
        _ => (year - 1, "WS"),
    }
}

pub fn semester_lexical_short(begin: DateTime<Utc>) -> String {
    let (year, season) = lexical_year_and_season(begin);
    format!("{year}{season}")
}

/// Appends the trailing two-digit year fragment for WS, since a winter
/// semester spans two calendar years (spec §4.1).
pub fn semester_lexical(begin: DateTime<Utc>) -> String {
    let (year, season) = lexical_year_and_season(begin);
    if season == "WS" {
        format!("{year}WS-{:02}", (year + 1) % 100)
    } else {
        format!("{year}SS")
    }
}

/// Short human display form of a semester's title: collapses the common
/// German season words to their two-letter abbreviation and trims
/// whitespace. Distinct from the purely date-derived lexical forms above.
fn semester_short(title: &str) -> String {
    title
        .replace("Wintersemester", "WS")
        .replace("Sommersemester", "SS")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Course abbreviation rule (spec §4.1): for each whitespace-separated
/// word, take its leading run of digits if it starts with one, otherwise
/// its first character as-is (case preserved, no uppercase/lowercase
/// classification of any kind). This is the reading of the rule that
/// reproduces both worked examples in spec §8 — "Algorithmen und
/// Datenstrukturen" → "AuD" (lowercase `u` from the lowercase conjunction
/// "und") and "Advanced Databases" → "AD" — and is the one resolved and
/// tested here per the Open Question in spec §9 about uppercase-letter
/// handling.
pub fn course_abbrev(title: &str) -> String {
    let mut out = String::new();
    for word in title.split_whitespace() {
        let mut chars = word.chars().peekable();
        if let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        out.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn course_abbrev_matches_worked_examples() {
        assert_eq!(course_abbrev("Algorithmen und Datenstrukturen"), "AuD");
        assert_eq!(course_abbrev("Advanced Databases"), "AD");
    }

    #[test]
    fn semester_lexical_short_winter() {
        assert_eq!(semester_lexical_short(date(2018, 10, 1)), "2018WS");
        assert_eq!(semester_lexical_short(date(2019, 2, 14)), "2018WS");
    }

    #[test]
    fn semester_lexical_short_summer() {
        assert_eq!(semester_lexical_short(date(2019, 4, 15)), "2019SS");
    }

    #[test]
    fn semester_lexical_appends_trailing_year_for_winter_only() {
        assert_eq!(semester_lexical(date(2018, 10, 1)), "2018WS-19");
        assert_eq!(semester_lexical(date(2019, 4, 15)), "2019SS");
    }

    #[test]
    fn short_path_strips_only_outermost_generic_root() {
        let roots = default_generic_roots();
        let chain = vec![
            Folder {
                id: "f1".into(),
                name: "Hauptordner".into(),
                parent_folder_id: None,
                course_id: "c1".into(),
                child_folder_ids: vec![],
                child_file_ids: vec![],
            },
            Folder {
                id: "f2".into(),
                name: "Hauptordner".into(), // nested folder that happens to share the name
                parent_folder_id: Some("f1".into()),
                course_id: "c1".into(),
                child_folder_ids: vec![],
                child_file_ids: vec![],
            },
        ];
        assert_eq!(render_path(&chain, &roots), "Hauptordner");
    }

    #[test]
    fn token_round_trips_through_str() {
        for t in Token::ALL {
            assert_eq!(t.as_str().parse::<Token>().unwrap(), t);
        }
    }
}
