// Query Planner: turns the research plan into a bounded list of search queries

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::info;

use super::{Outcome, Stage, PLANNER};
use crate::config::PlannerConfig;
use crate::error::PipelineError;
use crate::models::{Query, ResearchPlan};

pub struct QueryPlanner {
    max_queries: usize,
    site_filters: Vec<String>,
}

impl QueryPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            max_queries: config.max_queries,
            site_filters: config
                .site_filters
                .iter()
                .map(|f| f.trim().trim_start_matches('.').to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    /// Ready-made queries first, then one query per dimension and site filter.
    pub fn plan(&self, plan: &ResearchPlan) -> Vec<Query> {
        let mut candidates: Vec<Query> = plan
            .queries
            .iter()
            .map(|q| Query::new(q.trim(), None))
            .collect();

        for dimension in &plan.research_dimensions {
            if self.site_filters.is_empty() {
                candidates.push(Query::new(
                    format!("{} {}", plan.main_topic, dimension),
                    Some(dimension.clone()),
                ));
                continue;
            }
            for filter in &self.site_filters {
                candidates.push(Query::new(
                    format!("{} {} site:{}", plan.main_topic, dimension, filter),
                    Some(dimension.clone()),
                ));
            }
        }

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|q| !q.text.is_empty() && seen.insert(q.text.to_lowercase()))
            .take(self.max_queries)
            .collect()
    }
}

#[async_trait]
impl Stage for QueryPlanner {
    type Input = ResearchPlan;
    type Output = Vec<Query>;

    fn name(&self) -> &'static str {
        PLANNER
    }

    async fn run(&self, plan: ResearchPlan) -> Result<Outcome<Vec<Query>>, PipelineError> {
        let queries = self.plan(&plan);
        info!(
            count = queries.len(),
            cap = self.max_queries,
            "Planner: queries planned for {}",
            plan.main_topic
        );
        Ok(Outcome::ok(queries))
    }
}
