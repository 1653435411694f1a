//! Cobertura XML format parser

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeSet;

use super::{CoverageReport, FileCoverage};
use crate::error::CoverageError;

/// Lines accumulated for the `<class>` currently open
struct OpenClass {
    filename: String,
    covered: BTreeSet<u32>,
    missed: BTreeSet<u32>,
}

/// Parse Cobertura XML content from a string
///
/// Every `<class filename="...">` contributes its `<line>` children; classes
/// sharing a filename are merged.
pub fn parse_cobertura_string(content: &str) -> Result<CoverageReport, CoverageError> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut report = CoverageReport::new();
    let mut seen_root = false;
    let mut current: Option<OpenClass> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"coverage" => seen_root = true,
                b"class" => {
                    current = class_filename(e).map(|filename| OpenClass {
                        filename,
                        covered: BTreeSet::new(),
                        missed: BTreeSet::new(),
                    });
                }
                b"line" => record_line(e, current.as_mut())?,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"coverage" => seen_root = true,
                b"class" => {
                    // A class without lines still shows up in the report
                    if let Some(filename) = class_filename(e) {
                        report.merge(&filename, FileCoverage::default());
                    }
                }
                b"line" => record_line(e, current.as_mut())?,
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"class" {
                    // End of class, save file coverage
                    if let Some(class) = current.take() {
                        report.merge(&class.filename, FileCoverage::new(class.covered, class.missed));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CoverageError::parse(
                    "cobertura",
                    format!("at byte {}: {}", reader.buffer_position(), e),
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(CoverageError::parse("cobertura", "missing <coverage> root element"));
    }
    if current.is_some() {
        return Err(CoverageError::parse("cobertura", "unterminated <class> element"));
    }

    Ok(report)
}

fn class_filename(e: &BytesStart) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|attr| attr.key.as_ref() == b"filename")
        .and_then(|attr| attr.unescape_value().ok().map(|name| name.into_owned()))
        .filter(|name| !name.is_empty())
}

fn record_line(e: &BytesStart, class: Option<&mut OpenClass>) -> Result<(), CoverageError> {
    // <line> outside a class (e.g. in a summary section) carries no file
    let Some(class) = class else {
        return Ok(());
    };

    let mut number: Option<u32> = None;
    let mut hits: u64 = 0;

    for attr in e.attributes().filter_map(|a| a.ok()) {
        match attr.key.as_ref() {
            b"number" => {
                number = String::from_utf8_lossy(&attr.value).trim().parse::<u32>().ok();
            }
            b"hits" => {
                let value = String::from_utf8_lossy(&attr.value);
                hits = value
                    .trim()
                    .parse::<u64>()
                    .or_else(|_| value.trim().parse::<f64>().map(|v| u64::from(v > 0.0)))
                    .unwrap_or(0);
            }
            _ => {}
        }
    }

    let number = number.ok_or_else(|| {
        CoverageError::parse(
            "cobertura",
            format!("<line> without a valid number in {}", class.filename),
        )
    })?;

    if hits > 0 {
        class.missed.remove(&number);
        class.covered.insert(number);
    } else if !class.covered.contains(&number) {
        class.missed.insert(number);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<?xml version="1.0"?>
<coverage line-rate="0.8" branch-rate="0.5" lines-covered="80" lines-valid="100">
    <packages>
        <package name="src">
            <classes>
                <class name="main" filename="src/main.py" line-rate="0.75" branch-rate="0.5">
                    <methods>
                        <method name="run">
                            <lines>
                                <line number="2" hits="1"/>
                            </lines>
                        </method>
                    </methods>
                    <lines>
                        <line number="1" hits="1"/>
                        <line number="2" hits="1"/>
                        <line number="3" hits="0"/>
                        <line number="4" hits="1" branch="true" condition-coverage="50% (1/2)"/>
                    </lines>
                </class>
                <class name="empty" filename="src/empty.py"/>
            </classes>
        </package>
    </packages>
</coverage>"#;

    #[test]
    fn test_parse_cobertura() {
        let report = parse_cobertura_string(XML).unwrap();

        assert_eq!(report.len(), 2);
        let main = report.get("src/main.py").unwrap();
        assert_eq!(main.covered_lines().iter().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(main.missed_lines().iter().copied().collect::<Vec<_>>(), vec![3]);
        assert!((main.percentage() - 0.75).abs() < 1e-9);

        let empty = report.get("src/empty.py").unwrap();
        assert_eq!(empty.lines_total(), 0);
        assert_eq!(empty.percentage(), 0.0);
    }

    #[test]
    fn test_escaped_filename_is_unescaped() {
        let xml = r#"<coverage><packages><package><classes>
<class name="A" filename="src/a&amp;b.py"><lines><line number="1" hits="1"/></lines></class>
</classes></package></packages></coverage>"#;

        let report = parse_cobertura_string(xml).unwrap();

        let paths: Vec<&str> = report.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["src/a&b.py"]);
    }

    #[test]
    fn test_classes_sharing_a_file_are_merged() {
        let xml = r#"<coverage><packages><package><classes>
<class name="A" filename="pkg/mod.py"><lines><line number="1" hits="0"/><line number="2" hits="1"/></lines></class>
<class name="B" filename="pkg/mod.py"><lines><line number="1" hits="2"/><line number="9" hits="0"/></lines></class>
</classes></package></packages></coverage>"#;

        let report = parse_cobertura_string(xml).unwrap();
        let cov = report.get("pkg/mod.py").unwrap();

        assert_eq!(cov.covered_lines().iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(cov.missed_lines().iter().copied().collect::<Vec<_>>(), vec![9]);
        assert!(cov.covered_lines().is_disjoint(cov.missed_lines()));
    }

    #[test]
    fn test_malformed_xml_is_parse_error() {
        let xml = r#"<coverage><packages><class filename="a.py"></packages></coverage>"#;
        let err = parse_cobertura_string(xml).unwrap_err();
        assert!(matches!(err, CoverageError::Parse { format: "cobertura", .. }));
    }

    #[test]
    fn test_not_a_cobertura_document() {
        assert!(parse_cobertura_string("just some text").is_err());
        assert!(parse_cobertura_string("<report></report>").is_err());
    }

    #[test]
    fn test_parse_is_idempotent() {
        assert_eq!(
            parse_cobertura_string(XML).unwrap(),
            parse_cobertura_string(XML).unwrap()
        );
    }
}
