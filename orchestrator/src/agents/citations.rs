// Citation Manager: formats the reference list in source order

use async_trait::async_trait;
use tracing::info;

use super::{Outcome, Stage, CITATIONS};
use crate::error::PipelineError;
use crate::models::{Reference, Source};

pub struct CitationManager {
    show_credibility: bool,
}

impl CitationManager {
    pub fn new(show_credibility: bool) -> Self {
        Self { show_credibility }
    }

    /// `[n] Authors. Title. Journal/Publisher, Year. DOI-or-URL. Credibility: s/100`
    pub fn format(&self, index: usize, source: &Source) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !source.authors.is_empty() {
            parts.push(source.authors.join(", "));
        }
        parts.push(source.title.clone());

        let venue = source.journal.as_ref().or(source.publisher.as_ref());
        match (venue, source.year) {
            (Some(venue), Some(year)) => parts.push(format!("{}, {}", venue, year)),
            (Some(venue), None) => parts.push(venue.clone()),
            (None, Some(year)) => parts.push(year.to_string()),
            (None, None) => {}
        }

        match &source.doi {
            Some(doi) if !doi.is_empty() => parts.push(format!("https://doi.org/{}", doi)),
            _ => parts.push(source.url.clone()),
        }

        if self.show_credibility {
            parts.push(format!("Credibility: {}/100", source.credibility));
        }

        format!("[{}] {}.", index, parts.join(". "))
    }

    pub fn references(&self, sources: &[Source]) -> Vec<Reference> {
        sources
            .iter()
            .enumerate()
            .map(|(i, source)| Reference {
                index: i + 1,
                source_id: source.id,
                text: self.format(i + 1, source),
            })
            .collect()
    }
}

#[async_trait]
impl Stage for CitationManager {
    type Input = Vec<Source>;
    type Output = Vec<Reference>;

    fn name(&self) -> &'static str {
        CITATIONS
    }

    async fn run(&self, sources: Vec<Source>) -> Result<Outcome<Vec<Reference>>, PipelineError> {
        let references = self.references(&sources);
        info!(count = references.len(), "Citations: reference list built");
        Ok(Outcome::ok(references))
    }
}
