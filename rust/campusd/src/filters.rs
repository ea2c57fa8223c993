use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Departments that split a semester into sections when no department table
/// says otherwise.
pub const DEFAULT_SECTIONED_DEPARTMENTS: &[&str] = &["CSE", "ECE"];

pub const MIN_SEMESTER: u8 = 1;
pub const MAX_SEMESTER: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Semester(u8);

impl Semester {
    pub fn new(n: i64) -> Option<Self> {
        if (MIN_SEMESTER as i64..=MAX_SEMESTER as i64).contains(&n) {
            Some(Self(n as u8))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Semester {
    type Error = String;

    fn try_from(n: i64) -> Result<Self, Self::Error> {
        Semester::new(n).ok_or_else(|| {
            format!("semester must be in {}..={}", MIN_SEMESTER, MAX_SEMESTER)
        })
    }
}

impl From<Semester> for i64 {
    fn from(s: Semester) -> i64 {
        s.0 as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSelection {
    #[serde(default)]
    pub semester: Option<Semester>,
    #[serde(default)]
    pub department_code: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub subject_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Semester,
    Department,
    Section,
    Subject,
}

impl Field {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semester" => Some(Self::Semester),
            "department" | "departmentCode" => Some(Self::Department),
            "section" => Some(Self::Section),
            "subject" | "subjectCode" => Some(Self::Subject),
            _ => None,
        }
    }
}

/// One edited field together with its new value. `None` clears the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Semester(Option<Semester>),
    Department(Option<String>),
    Section(Option<String>),
    Subject(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub selection: FilterSelection,
    /// The subject list for (semester, department) must be fetched again.
    pub needs_subject_refetch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterState {
    Empty,
    PartialNoSection,
    PartialWithSection,
    Ready,
}

/// Which departments expose a section dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPolicy {
    sectioned: BTreeSet<String>,
}

impl Default for SectionPolicy {
    fn default() -> Self {
        Self::from_codes(DEFAULT_SECTIONED_DEPARTMENTS.iter().copied())
    }
}

impl SectionPolicy {
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sectioned: codes
                .into_iter()
                .map(|c| normalize_code(c.as_ref()))
                .collect(),
        }
    }

    pub fn has_sections(&self, department_code: &str) -> bool {
        self.sectioned.contains(&normalize_code(department_code))
    }

    /// Section is required only once a sectioned department is selected.
    pub fn requires_section(&self, selection: &FilterSelection) -> bool {
        selection
            .department_code
            .as_deref()
            .map(|d| self.has_sections(d))
            .unwrap_or(false)
    }

    pub fn apply(&self, current: &FilterSelection, change: Change) -> Resolution {
        let mut next = current.clone();
        let mut needs_subject_refetch = false;

        match change {
            Change::Semester(v) => {
                next.semester = v;
                next.subject_code = None;
                needs_subject_refetch = true;
            }
            Change::Department(v) => {
                next.department_code = v.map(|d| normalize_code(&d)).filter(|d| !d.is_empty());
                next.subject_code = None;
                needs_subject_refetch = true;
            }
            Change::Section(v) => {
                next.section = v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            }
            Change::Subject(v) => {
                next.subject_code = v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            }
        }

        // A department without sections never carries one.
        if let Some(dept) = next.department_code.as_deref() {
            if !self.has_sections(dept) {
                next.section = None;
            }
        }

        Resolution {
            selection: next,
            needs_subject_refetch,
        }
    }

    pub fn state(&self, selection: &FilterSelection) -> FilterState {
        if selection.semester.is_none() || selection.department_code.is_none() {
            return FilterState::Empty;
        }
        let needs_section = self.requires_section(selection);
        let section_ok = !needs_section || selection.section.is_some();
        if section_ok && selection.subject_code.is_some() {
            return FilterState::Ready;
        }
        if needs_section {
            FilterState::PartialWithSection
        } else {
            FilterState::PartialNoSection
        }
    }

    pub fn can_submit(&self, selection: &FilterSelection, roster_len: usize) -> bool {
        roster_len > 0 && self.state(selection) == FilterState::Ready
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn department_has_sections(department_code: &str) -> bool {
    SectionPolicy::default().has_sections(department_code)
}

/// Tickets handed out for fetches of one view (attendance roster or marks
/// sheet). A submission that carries an older ticket than the latest one was
/// built from a view the user has since replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchGeneration {
    latest: u64,
}

impl FetchGeneration {
    pub fn issue(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        ticket == self.latest
    }
}
