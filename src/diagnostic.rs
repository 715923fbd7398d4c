use std::ops::Range;

use crate::error::BuildError;
use crate::net::node::root_name;

/// A construction diagnostic (error or warning) located in the net
/// definition text.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Layer the diagnostic points at, if any.
    pub layer: Option<String>,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    pub fn error(message: String) -> Self {
        Self {
            severity: Severity::Error,
            message,
            layer: None,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    pub fn at_layer(mut self, layer: Option<&str>) -> Self {
        self.layer = layer.map(|l| root_name(l).to_string());
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    /// Byte range of the layer's key in `source`, or an empty range at
    /// the start.
    pub fn span(&self, source: &str) -> Range<usize> {
        self.layer
            .as_deref()
            .and_then(|layer| locate_key(source, layer))
            .unwrap_or(0..0)
    }

    fn report<'s>(
        &self,
        filename: &'s str,
        source: &str,
        color: bool,
    ) -> ariadne::Report<'static, (&'s str, Range<usize>)> {
        use ariadne::{Color, Config, Label, Report, ReportKind};

        let (kind, paint) = match self.severity {
            Severity::Error => (ReportKind::Error, Color::Red),
            Severity::Warning => (ReportKind::Warning, Color::Yellow),
        };
        let span = self.span(source);

        let mut report = Report::build(kind, filename, span.start)
            .with_config(Config::default().with_color(color))
            .with_message(&self.message);
        if self.layer.is_some() {
            report = report.with_label(
                Label::new((filename, span))
                    .with_message(&self.message)
                    .with_color(paint),
            );
        }
        for note in &self.notes {
            report = report.with_note(note);
        }
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }
        report.finish()
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, filename: &str, source: &str) -> std::io::Result<()> {
        self.report(filename, source, true)
            .eprint((filename, ariadne::Source::from(source)))
    }

    /// Render without colors, for logs and tests.
    pub fn render_plain(&self, filename: &str, source: &str) -> String {
        let mut out = Vec::new();
        let written = self
            .report(filename, source, false)
            .write((filename, ariadne::Source::from(source)), &mut out);
        match written {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(_) => self.message.clone(),
        }
    }
}

impl From<&BuildError> for Diagnostic {
    fn from(err: &BuildError) -> Self {
        let diag = Diagnostic::error(err.to_string()).at_layer(err.layer());
        match err {
            BuildError::TemplateIncomplete {
                stack, errors, ..
            } => {
                let mut diag = diag;
                if !stack.is_empty() {
                    diag = diag.with_note(format!("constructing: {}", stack.join(" -> ")));
                }
                for e in errors {
                    diag = diag.with_note(format!("recovered earlier: {}", e));
                }
                diag
            }
            BuildError::ConstructionLoop { .. } | BuildError::MissingDescriptor { .. } => diag
                .with_help("the layer's output descriptor depends on itself; give it an explicit n_out".to_string()),
            BuildError::CyclicDependency { .. } => diag
                .with_help("break the cycle with a 'prev:' reference".to_string()),
            BuildError::NoLengthSource => diag.with_help(
                "set fixed_length, name a target, define an 'end' layer or declare data:source"
                    .to_string(),
            ),
            BuildError::MissingOutput => {
                diag.with_help("every subnetwork needs a layer named 'output'".to_string())
            }
            BuildError::InconsistentBeam { choice, .. } => {
                diag.with_note(format!("the beam is owned by choice '{}'", choice))
            }
            _ => diag,
        }
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(
    diagnostics: &[Diagnostic],
    filename: &str,
    source: &str,
) -> std::io::Result<()> {
    for diag in diagnostics {
        diag.render(filename, source)?;
    }
    Ok(())
}

/// `"<layer>"` used as an object key.
fn locate_key(source: &str, layer: &str) -> Option<Range<usize>> {
    let needle = format!("\"{}\"", layer);
    source.match_indices(&needle).find_map(|(at, _)| {
        let end = at + needle.len();
        source[end..]
            .trim_start()
            .starts_with(':')
            .then_some(at..end)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET: &str = r#"{
  "lin": {"class": "linear", "from": ["output"], "n_out": 3},
  "output": {"class": "linear", "from": "lin", "n_out": 3}
}"#;

    #[test]
    fn key_is_located_not_reference() {
        let d = Diagnostic::error("cycle".to_string()).at_layer(Some("output"));
        let span = d.span(NET);
        assert_eq!(&NET[span.clone()], "\"output\"");
        assert!(span.start > NET.find("[\"output\"]").unwrap());
    }

    #[test]
    fn sub_layers_point_at_their_root() {
        let d = Diagnostic::error("bad".to_string()).at_layer(Some("lin/state"));
        assert_eq!(d.layer.as_deref(), Some("lin"));
        assert_eq!(&NET[d.span(NET)], "\"lin\"");
    }

    #[test]
    fn unknown_layer_falls_back_to_start() {
        let d = Diagnostic::warning("odd".to_string()).at_layer(Some("nope"));
        assert_eq!(d.span(NET), 0..0);
        assert_eq!(d.severity, Severity::Warning);
    }

    #[test]
    fn incomplete_template_lists_recovered_errors() {
        let err = BuildError::TemplateIncomplete {
            unfinished: vec!["a".into()],
            stack: vec!["output".into(), "a".into()],
            errors: vec!["construction loop at layer 'a'".into()],
        };
        let d = Diagnostic::from(&err);
        assert!(d.layer.is_none());
        assert_eq!(d.notes.len(), 2);
        assert_eq!(d.notes[0], "constructing: output -> a");
    }

    #[test]
    fn plain_rendering_names_the_layer() {
        let err = BuildError::CyclicDependency {
            cycle: vec!["lin".into(), "output".into()],
        };
        let text = Diagnostic::from(&err).render_plain("net.json", NET);
        assert!(text.contains("cyclic current-step dependency: lin -> output"));
        assert!(text.contains("net.json"));
        assert!(text.contains("prev:"));
    }
}
