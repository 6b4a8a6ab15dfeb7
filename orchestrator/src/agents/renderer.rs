// Renderer: HTML report via handlebars, with a best-effort PDF rendering

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use genpdf::elements::{Break, Paragraph};
use genpdf::style::{Style, StyledString};
use genpdf::{Document, SimplePageDecorator};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::{info, warn};

use super::{Outcome, Stage, RENDERER};
use crate::config::{RenderConfig, RenderEngine};
use crate::error::PipelineError;
use crate::models::{sections, Reference, RefinedDocument, RenderedReport, ReportMetadata};

const TEMPLATE_NAME: &str = "report";

const REPORT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{{topic}}</title>
<style>
body { font-family: Georgia, serif; max-width: 50rem; margin: 2rem auto; line-height: 1.6; color: #222; }
header.cover { text-align: center; border-bottom: 1px solid #ccc; padding-bottom: 1.5rem; margin-bottom: 2rem; }
h1 { font-size: 2rem; margin-bottom: 0.25rem; }
h2 { border-bottom: 1px solid #eee; padding-bottom: 0.2rem; }
.executive-summary { background: #f6f8fa; padding: 0.5rem 1.25rem; }
.references p { font-size: 0.9rem; }
</style>
</head>
<body>
<header class="cover">
<h1>{{topic}}</h1>
{{#if subject}}<p class="subject">{{subject}}</p>{{/if}}
<p class="byline">{{researcher}}{{#if institution}} &middot; {{institution}}{{/if}}</p>
<p class="date">{{date}}</p>
</header>
<section class="executive-summary">
<h2>Executive Summary</h2>
{{#each executive_summary}}<p>{{this}}</p>
{{/each}}</section>
{{#each sections}}<section>
<h2>{{heading}}</h2>
{{#each paragraphs}}<p>{{this}}</p>
{{/each}}</section>
{{/each}}<section class="references">
<h2>References</h2>
{{#each references}}<p>{{this}}</p>
{{/each}}</section>
</body>
</html>
"#;

pub struct RenderInput {
    pub document: RefinedDocument,
    pub references: Vec<Reference>,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, Serialize)]
struct SectionView {
    heading: String,
    paragraphs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ReportView {
    topic: String,
    subject: String,
    researcher: String,
    institution: String,
    date: String,
    executive_summary: Vec<String>,
    sections: Vec<SectionView>,
    references: Vec<String>,
}

impl ReportView {
    fn new(input: &RenderInput) -> Self {
        let meta = &input.metadata;
        Self {
            topic: meta.topic().to_string(),
            subject: meta.subject().to_string(),
            researcher: meta.researcher().to_string(),
            institution: meta.institution().to_string(),
            date: meta.date().format("%B %-d, %Y").to_string(),
            executive_summary: paragraphs(&input.document.executive_summary),
            sections: ordered_sections(&input.document),
            references: input.references.iter().map(|r| r.text.clone()).collect(),
        }
    }
}

fn paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Known sections in report order with main sections inlined, then any
/// extra keys alphabetically.
fn ordered_sections(document: &RefinedDocument) -> Vec<SectionView> {
    let draft = &document.draft;
    let mut views = Vec::new();

    for key in sections::ORDER {
        if key == sections::MAIN_SECTIONS {
            views.extend(draft.main_sections.iter().map(|s| SectionView {
                heading: s.title.clone(),
                paragraphs: paragraphs(&s.content),
            }));
            continue;
        }
        if let Some(text) = draft.section(key) {
            views.push(SectionView {
                heading: sections::heading(key),
                paragraphs: paragraphs(text),
            });
        }
    }

    for (key, text) in &draft.sections {
        if sections::ORDER.contains(&key.as_str()) || key == sections::EXECUTIVE_SUMMARY {
            continue;
        }
        views.push(SectionView {
            heading: sections::heading(key),
            paragraphs: paragraphs(text),
        });
    }

    views
}

pub struct Renderer {
    registry: Handlebars<'static>,
    engine: RenderEngine,
    font_dir: PathBuf,
    font_family: String,
}

impl Renderer {
    pub fn new(config: &RenderConfig) -> Result<Self, PipelineError> {
        let mut registry = Handlebars::new();
        registry
            .register_template_string(TEMPLATE_NAME, REPORT_TEMPLATE)
            .map_err(|e| PipelineError::Render(e.to_string()))?;
        Ok(Self {
            registry,
            engine: config.engine,
            font_dir: config.font_dir.clone(),
            font_family: config.font_family.clone(),
        })
    }

    fn render_html(&self, view: &ReportView) -> Result<String, PipelineError> {
        self.registry
            .render(TEMPLATE_NAME, view)
            .map_err(|e| PipelineError::Render(e.to_string()))
    }

    /// Font loading and layout are blocking work, kept off the async workers.
    async fn render_pdf(&self, view: &ReportView) -> Result<Bytes, String> {
        let font_dir = self.font_dir.clone();
        let font_family = self.font_family.clone();
        let view = view.clone();
        tokio::task::spawn_blocking(move || layout_pdf(&font_dir, &font_family, &view))
            .await
            .map_err(|e| format!("PDF task failed: {}", e))?
    }
}

fn layout_pdf(font_dir: &Path, font_family: &str, view: &ReportView) -> Result<Bytes, String> {
    let fonts = genpdf::fonts::from_files(font_dir, font_family, None)
        .map_err(|e| format!("fonts unavailable: {}", e))?;

    let mut doc = Document::new(fonts);
    doc.set_title(view.topic.clone());

    let mut decorator = SimplePageDecorator::new();
    decorator.set_margins(25);
    doc.set_page_decorator(decorator);

    let heading = Style::new().bold().with_font_size(14);
    doc.push(Paragraph::new(StyledString::new(
        view.topic.clone(),
        Style::new().bold().with_font_size(20),
    )));
    if !view.subject.is_empty() {
        doc.push(Paragraph::new(view.subject.clone()));
    }
    let byline = [view.researcher.as_str(), view.institution.as_str()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if !byline.is_empty() {
        doc.push(Paragraph::new(byline));
    }
    doc.push(Paragraph::new(view.date.clone()));
    doc.push(Break::new(1.5));

    let mut push_section = |title: &str, body: &[String]| {
        doc.push(Paragraph::new(StyledString::new(title.to_string(), heading)));
        doc.push(Break::new(0.5));
        for p in body {
            doc.push(Paragraph::new(p.clone()));
            doc.push(Break::new(0.5));
        }
        doc.push(Break::new(1));
    };

    push_section("Executive Summary", &view.executive_summary);
    for section in &view.sections {
        push_section(&section.heading, &section.paragraphs);
    }
    push_section("References", &view.references);

    let mut buf = Vec::new();
    doc.render(&mut buf).map_err(|e| format!("PDF rendering failed: {}", e))?;
    Ok(Bytes::from(buf))
}

#[async_trait]
impl Stage for Renderer {
    type Input = RenderInput;
    type Output = RenderedReport;

    fn name(&self) -> &'static str {
        RENDERER
    }

    async fn run(&self, input: RenderInput) -> Result<Outcome<RenderedReport>, PipelineError> {
        let view = ReportView::new(&input);
        let html = self.render_html(&view)?;
        info!(bytes = html.len(), sections = view.sections.len(), "Renderer: HTML rendered");

        let mut warnings = Vec::new();
        let pdf = match self.engine {
            RenderEngine::Html => None,
            RenderEngine::HtmlPdf => match self.render_pdf(&view).await {
                Ok(pdf) => {
                    info!(bytes = pdf.len(), "Renderer: PDF rendered");
                    Some(pdf)
                }
                Err(reason) => {
                    warn!(%reason, "Renderer: PDF unavailable, returning HTML only");
                    warnings.push(format!("PDF not produced: {}", reason));
                    None
                }
            },
        };

        Ok(Outcome::ok(RenderedReport { html, pdf }).with_warnings(warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Draft, MainSection};
    use chrono::NaiveDate;

    fn input(topic: &str) -> RenderInput {
        let mut draft = Draft::default();
        draft.sections.insert("conclusion".into(), "Closing words.".into());
        draft.sections.insert("abstract".into(), "Abstract <b>bold</b> text.".into());
        draft.sections.insert("introduction".into(), "Intro one.\n\nIntro two.".into());
        draft.sections.insert("appendixNotes".into(), "Extra.".into());
        draft.main_sections = vec![
            MainSection { title: "First finding".into(), content: "Body one.".into() },
            MainSection { title: "Second finding".into(), content: "Body two.".into() },
        ];
        RenderInput {
            document: RefinedDocument {
                executive_summary: "Summary & overview.".into(),
                draft,
            },
            references: vec![Reference {
                index: 1,
                source_id: 1,
                text: "[1] Title. https://a.edu/x?a=1&b=2.".into(),
            }],
            metadata: ReportMetadata::new(
                topic,
                "Security",
                "Eve \"the tester\"",
                "Lab",
                NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            )
            .unwrap(),
        }
    }

    fn html_renderer() -> Renderer {
        Renderer::new(&RenderConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn escapes_user_and_generated_text() {
        let outcome = html_renderer().run(input("<script>alert(1)</script>")).await.unwrap();
        let html = outcome.value.html;
        assert!(!html.contains("<script>alert(1)</script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<b>bold</b>"));
        assert!(html.contains("Summary &amp; overview."));
        assert!(!html.contains("Eve \"the tester\""));
    }

    #[tokio::test]
    async fn sections_follow_report_order() {
        let html = html_renderer().run(input("Topic")).await.unwrap().value.html;
        let pos = |needle: &str| html.find(needle).unwrap_or_else(|| panic!("missing {}", needle));
        let order = [
            "Executive Summary",
            "<h2>Abstract</h2>",
            "<h2>Introduction</h2>",
            "<h2>First finding</h2>",
            "<h2>Second finding</h2>",
            "<h2>Conclusion</h2>",
            "<h2>Appendix Notes</h2>",
            "<h2>References</h2>",
        ];
        for pair in order.windows(2) {
            assert!(pos(pair[0]) < pos(pair[1]), "{} before {}", pair[0], pair[1]);
        }
        assert!(html.contains("<p>Intro two.</p>"));
        assert!(html.contains("October 19, 2026"));
    }

    #[tokio::test]
    async fn missing_pdf_backend_still_returns_html() {
        let fonts = tempfile::TempDir::new().unwrap();
        let renderer = Renderer::new(&RenderConfig {
            engine: RenderEngine::HtmlPdf,
            font_dir: fonts.path().to_path_buf(),
            font_family: "NoSuchFont".into(),
        })
        .unwrap();

        let outcome = renderer.run(input("Topic")).await.unwrap();
        assert!(outcome.value.pdf.is_none());
        assert!(outcome.value.html.starts_with("<!DOCTYPE html>"));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn pdf_layout_runs_off_the_async_worker() {
        let fonts = tempfile::TempDir::new().unwrap();
        let renderer = Renderer::new(&RenderConfig {
            engine: RenderEngine::HtmlPdf,
            font_dir: fonts.path().to_path_buf(),
            font_family: "NoSuchFont".into(),
        })
        .unwrap();
        let view = ReportView::new(&input("Topic"));

        let direct = layout_pdf(fonts.path(), "NoSuchFont", &view).unwrap_err();
        let offloaded = renderer.render_pdf(&view).await.unwrap_err();
        assert_eq!(offloaded, direct);
        assert!(offloaded.starts_with("fonts unavailable"));

        let outcome = renderer.run(input("Topic")).await.unwrap();
        assert_eq!(outcome.warnings, vec![format!("PDF not produced: {}", direct)]);
    }

    #[tokio::test]
    async fn html_engine_leaves_pdf_slot_empty() {
        let outcome = html_renderer().run(input("Topic")).await.unwrap();
        assert!(outcome.value.pdf.is_none());
        assert!(outcome.warnings.is_empty());
    }
}
