//! Reaction-rule tables and adduct-scoped filtering.
//!
//! A rule table is a tab-delimited text file made of four regions in a fixed
//! order:
//!
//! 1. a header block between `<datawarrior-fileinfo>` and `</datawarrior-fileinfo>`
//!    which carries the `<rowcount="N">` marker,
//! 2. an optional column property block between `<column properties>` and
//!    `</column properties>`,
//! 3. a column header row followed by the data rows, one rule per line,
//! 4. an epilogue, starting at the first line after the data rows which begins
//!    with `<`, kept verbatim.
//!
//! The table is consumed by an external fragmentation engine, so every line that
//! survives a [`RuleTable::filter_by_label`] call keeps its exact bytes, including
//! its line terminator.
use std::collections::BTreeSet;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, trace};

/// The name of an ionization variant, e.g. `H`, `Na` or `K`
pub type AdductLabel = String;

const MARKER: char = '<';
const HEADER_START: &str = "<datawarrior-fileinfo>";
const HEADER_END: &str = "</datawarrior-fileinfo>";
const PROPERTIES_START: &str = "<column properties>";
const PROPERTIES_END: &str = "</column properties>";
const ROW_COUNT_PREFIX: &str = "<rowcount=\"";

const IONIZATION_KIND: &str = "ionization";
const POSITIVE_MODE: &str = "positive";

#[derive(Debug, Error)]
pub enum RuleFileError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The reaction rule table is missing its `{0}` marker")]
    MissingMarker(&'static str),
    #[error("The reaction rule table has no column header row")]
    MissingColumnHeader,
    #[error("Malformed row count marker on line {line}: {content:?}")]
    MalformedRowCount { line: usize, content: String },
}

/// The explicit states of the line parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Header,
    ColumnProperties,
    ColumnHeaderRow,
    DataRows,
    Epilogue,
}

fn content_of(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn terminator_of(line: &str) -> &str {
    &line[content_of(line).len()..]
}

/// The positions of the typed columns in the column header row
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ColumnLayout {
    kind: Option<usize>,
    mode: Option<usize>,
    label: Option<usize>,
}

impl ColumnLayout {
    fn from_header(header: &str) -> Self {
        let mut layout = Self::default();
        for (i, name) in content_of(header).split('\t').enumerate() {
            let name = name.trim();
            if name.eq_ignore_ascii_case("kind") {
                layout.kind.get_or_insert(i);
            } else if name.eq_ignore_ascii_case("mode") {
                layout.mode.get_or_insert(i);
            } else if name.eq_ignore_ascii_case("label") {
                layout.label.get_or_insert(i);
            }
        }
        layout
    }
}

/// A single data row of a [`RuleTable`].
///
/// The typed fields are populated from the columns named `kind`, `mode` and
/// `label`, while the exact source line is retained for re-serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRow {
    pub kind: Option<String>,
    pub mode: Option<String>,
    pub label: Option<String>,
    pub fields: Vec<String>,
    raw: String,
}

impl RuleRow {
    fn parse(line: &str, layout: &ColumnLayout) -> Self {
        let fields: Vec<String> = content_of(line).split('\t').map(String::from).collect();
        let pick = |i: Option<usize>| {
            i.and_then(|i| fields.get(i))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        Self {
            kind: pick(layout.kind),
            mode: pick(layout.mode),
            label: pick(layout.label),
            raw: line.to_string(),
            fields,
        }
    }

    /// The exact source line, including its terminator
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_blank(&self) -> bool {
        content_of(&self.raw).trim().is_empty()
    }

    pub fn is_ionization(&self) -> bool {
        self.kind.as_deref() == Some(IONIZATION_KIND)
    }

    pub fn is_positive_mode(&self) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|m| m.contains(POSITIVE_MODE))
    }
}

/// A parsed reaction-rule table.
///
/// Rendering an unmodified table with [`Display`] reproduces the source text
/// byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    preamble: Vec<String>,
    row_count_line: Option<usize>,
    column_header: String,
    rows: Vec<RuleRow>,
    epilogue: Vec<String>,
}

impl RuleTable {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, RuleFileError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let table: Self = text.parse()?;
        debug!(
            "Read {} reaction rules from {}",
            table.row_count(),
            path.display()
        );
        Ok(table)
    }

    pub fn parse_str(text: &str) -> Result<Self, RuleFileError> {
        let mut state = ParserState::Header;
        let mut preamble = Vec::new();
        let mut row_count_line = None;
        let mut column_header = None;
        let mut layout = ColumnLayout::default();
        let mut rows = Vec::new();
        let mut epilogue = Vec::new();

        for (lineno, line) in text.split_inclusive('\n').enumerate() {
            let content = content_of(line);
            trace!("{state:?} {lineno}: {content}");
            match state {
                ParserState::Header => {
                    if preamble.is_empty() && content.trim() != HEADER_START {
                        return Err(RuleFileError::MissingMarker(HEADER_START));
                    }
                    if content.starts_with(ROW_COUNT_PREFIX) {
                        parse_row_count(content).ok_or_else(|| {
                            RuleFileError::MalformedRowCount {
                                line: lineno + 1,
                                content: content.to_string(),
                            }
                        })?;
                        row_count_line = Some(preamble.len());
                    }
                    preamble.push(line.to_string());
                    if content.trim() == HEADER_END {
                        state = ParserState::ColumnHeaderRow;
                    }
                }
                ParserState::ColumnProperties => {
                    preamble.push(line.to_string());
                    if content.trim() == PROPERTIES_END {
                        state = ParserState::ColumnHeaderRow;
                    }
                }
                ParserState::ColumnHeaderRow => {
                    if content.trim() == PROPERTIES_START {
                        preamble.push(line.to_string());
                        state = ParserState::ColumnProperties;
                    } else if content.starts_with(MARKER) || content.trim().is_empty() {
                        return Err(RuleFileError::MissingColumnHeader);
                    } else {
                        layout = ColumnLayout::from_header(line);
                        column_header = Some(line.to_string());
                        state = ParserState::DataRows;
                    }
                }
                ParserState::DataRows => {
                    if content.starts_with(MARKER) {
                        epilogue.push(line.to_string());
                        state = ParserState::Epilogue;
                    } else {
                        rows.push(RuleRow::parse(line, &layout));
                    }
                }
                ParserState::Epilogue => {
                    epilogue.push(line.to_string());
                }
            }
        }

        match state {
            ParserState::Header => Err(RuleFileError::MissingMarker(HEADER_END)),
            ParserState::ColumnProperties => Err(RuleFileError::MissingMarker(PROPERTIES_END)),
            ParserState::ColumnHeaderRow => Err(RuleFileError::MissingColumnHeader),
            ParserState::DataRows | ParserState::Epilogue => Ok(Self {
                preamble,
                row_count_line,
                column_header: column_header.ok_or(RuleFileError::MissingColumnHeader)?,
                rows,
                epilogue,
            }),
        }
    }

    pub fn rows(&self) -> &[RuleRow] {
        &self.rows
    }

    /// The number of non-blank data rows
    pub fn row_count(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_blank()).count()
    }

    /// The value of the `<rowcount="N">` marker, if the header carries one
    pub fn declared_row_count(&self) -> Option<usize> {
        self.row_count_line
            .and_then(|i| self.preamble.get(i))
            .and_then(|line| parse_row_count(content_of(line)))
    }

    pub fn column_header(&self) -> &str {
        content_of(&self.column_header)
    }

    /// Collect the distinct labels of the positive-mode ionization rules
    pub fn discover_labels(&self) -> BTreeSet<AdductLabel> {
        self.rows
            .iter()
            .filter(|r| r.is_ionization() && r.is_positive_mode())
            .filter_map(|r| r.label.clone())
            .collect()
    }

    /// Build a copy of this table that keeps every non-ionization rule and only those
    /// ionization rules carrying `label`, with the row count marker rewritten to match.
    pub fn filter_by_label(&self, label: &str) -> Self {
        let rows: Vec<RuleRow> = self
            .rows
            .iter()
            .filter(|r| !r.is_ionization() || r.label.as_deref() == Some(label))
            .cloned()
            .collect();

        let mut dup = Self {
            preamble: self.preamble.clone(),
            row_count_line: self.row_count_line,
            column_header: self.column_header.clone(),
            rows,
            epilogue: self.epilogue.clone(),
        };

        let retained = dup.row_count();
        match dup.row_count_line {
            Some(i) => {
                let line = &dup.preamble[i];
                dup.preamble[i] = rewrite_row_count(line, retained);
            }
            None => {
                debug!("Reaction rule table has no row count marker to rewrite")
            }
        }
        debug!(
            "Filtered reaction rules for {label}: kept {retained} of {}",
            self.row_count()
        );
        dup
    }
}

impl FromStr for RuleTable {
    type Err = RuleFileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl Display for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in self.preamble.iter() {
            f.write_str(line)?;
        }
        f.write_str(&self.column_header)?;
        for row in self.rows.iter() {
            f.write_str(&row.raw)?;
        }
        for line in self.epilogue.iter() {
            f.write_str(line)?;
        }
        Ok(())
    }
}

fn parse_row_count(content: &str) -> Option<usize> {
    let rest = content.strip_prefix(ROW_COUNT_PREFIX)?;
    let end = rest.find('"')?;
    rest[..end].parse().ok()
}

fn rewrite_row_count(line: &str, count: usize) -> String {
    let content = content_of(line);
    // The marker was validated on parse, so the closing quote is present
    let rest = &content[ROW_COUNT_PREFIX.len()..];
    let end = rest.find('"').unwrap_or(rest.len());
    format!(
        "{ROW_COUNT_PREFIX}{count}{}{}",
        &rest[end..],
        terminator_of(line)
    )
}

#[cfg(test)]
mod test {
    use super::*;

    const RULES: &str = "<datawarrior-fileinfo>\n\
<version=\"3.3\">\n\
<rowcount=\"5\">\n\
</datawarrior-fileinfo>\n\
<column properties>\n\
<columnName=\"Rxn\">\n\
<columnProperty=\"specialType\tidcode\">\n\
</column properties>\n\
Rxn\tkind\tmode\tlabel\tcomment\n\
rxn:glycosidic\treaction\tpositive\t\tbond cleavage\n\
rxn:protonation\tionization\tpositive\tH\tadds H+\n\
rxn:sodiation\tionization\tpositive\tNa\tadds Na+\n\
rxn:potassiation\tionization\tpositive\tK\tadds K+\n\
rxn:crossring\treaction\tpositive\t\tring cleavage\n\
<datawarrior properties>\n\
<axisColumn_2D View_0=\"kind\">\n\
</datawarrior properties>\n";

    #[test]
    fn test_round_trip() -> Result<(), RuleFileError> {
        let table: RuleTable = RULES.parse()?;
        assert_eq!(table.to_string(), RULES);
        assert_eq!(table.row_count(), 5);
        assert_eq!(table.declared_row_count(), Some(5));
        assert_eq!(table.column_header(), "Rxn\tkind\tmode\tlabel\tcomment");
        Ok(())
    }

    #[test]
    fn test_discover_labels() -> Result<(), RuleFileError> {
        let table: RuleTable = RULES.parse()?;
        let labels: Vec<_> = table.discover_labels().into_iter().collect();
        assert_eq!(labels, vec!["H", "K", "Na"]);
        Ok(())
    }

    #[test]
    fn test_discover_labels_skips_negative_and_duplicates() -> Result<(), RuleFileError> {
        let text = RULES.replace(
            "rxn:crossring\treaction\tpositive\t\tring cleavage\n",
            "rxn:deprotonation\tionization\tnegative\tmH\tremoves H+\nrxn:protonation2\tionization\tpositive\tH\tagain\n",
        );
        let table: RuleTable = text.parse()?;
        let labels: Vec<_> = table.discover_labels().into_iter().collect();
        assert_eq!(labels, vec!["H", "K", "Na"]);
        Ok(())
    }

    #[test]
    fn test_filter_by_label() -> Result<(), RuleFileError> {
        let table: RuleTable = RULES.parse()?;
        let filtered = table.filter_by_label("Na");
        let expected = RULES
            .replace("<rowcount=\"5\">", "<rowcount=\"3\">")
            .replace("rxn:protonation\tionization\tpositive\tH\tadds H+\n", "")
            .replace("rxn:potassiation\tionization\tpositive\tK\tadds K+\n", "");
        assert_eq!(filtered.to_string(), expected);
        assert_eq!(filtered.declared_row_count(), Some(filtered.row_count()));

        let ionization: Vec<_> = filtered
            .rows()
            .iter()
            .filter(|r| r.is_ionization())
            .collect();
        assert_eq!(ionization.len(), 1);
        assert_eq!(ionization[0].label.as_deref(), Some("Na"));

        let kept_other: Vec<_> = filtered
            .rows()
            .iter()
            .filter(|r| !r.is_ionization())
            .map(|r| r.raw())
            .collect();
        let source_other: Vec<_> = table
            .rows()
            .iter()
            .filter(|r| !r.is_ionization())
            .map(|r| r.raw())
            .collect();
        assert_eq!(kept_other, source_other);
        Ok(())
    }

    #[test]
    fn test_filter_preserves_crlf() -> Result<(), RuleFileError> {
        let text = RULES.replace('\n', "\r\n");
        let table: RuleTable = text.parse()?;
        assert_eq!(table.to_string(), text);
        let filtered = table.filter_by_label("K");
        let rendered = filtered.to_string();
        assert!(rendered.contains("<rowcount=\"3\">\r\n"));
        assert!(rendered.contains("rxn:potassiation\tionization\tpositive\tK\tadds K+\r\n"));
        assert!(!rendered.contains("\tNa\t"));
        Ok(())
    }

    #[test]
    fn test_filter_is_stable() -> Result<(), RuleFileError> {
        let table: RuleTable = RULES.parse()?;
        let once = table.filter_by_label("H").to_string();
        let twice = once.parse::<RuleTable>()?.filter_by_label("H").to_string();
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn test_missing_markers() {
        let truncated = RULES.replace("</datawarrior-fileinfo>\n", "");
        assert!(matches!(
            truncated.parse::<RuleTable>(),
            Err(RuleFileError::MissingMarker(_))
        ));

        let truncated = RULES.replace("</column properties>\n", "");
        assert!(matches!(
            truncated.parse::<RuleTable>(),
            Err(RuleFileError::MissingMarker(PROPERTIES_END))
        ));

        assert!(matches!(
            "Rxn\tkind\n".parse::<RuleTable>(),
            Err(RuleFileError::MissingMarker(HEADER_START))
        ));

        let headerless = "<datawarrior-fileinfo>\n<rowcount=\"0\">\n</datawarrior-fileinfo>\n";
        assert!(matches!(
            headerless.parse::<RuleTable>(),
            Err(RuleFileError::MissingColumnHeader)
        ));
    }

    #[test]
    fn test_malformed_row_count() {
        let text = RULES.replace("<rowcount=\"5\">", "<rowcount=\"five\">");
        assert!(matches!(
            text.parse::<RuleTable>(),
            Err(RuleFileError::MalformedRowCount { line: 3, .. })
        ));
    }

    #[test]
    fn test_without_properties_block() -> Result<(), RuleFileError> {
        let text = RULES.replace(
            "<column properties>\n<columnName=\"Rxn\">\n<columnProperty=\"specialType\tidcode\">\n</column properties>\n",
            "",
        );
        let table: RuleTable = text.parse()?;
        assert_eq!(table.to_string(), text);
        assert_eq!(table.discover_labels().len(), 3);
        Ok(())
    }
}
