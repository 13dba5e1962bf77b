//! Portal collaborators: quiz catalog, play history, enrollment and
//! submission.

use async_trait::async_trait;
use serde_json::json;

use super::api_client::ApiClient;
use super::filter_service::QuizFilter;
use crate::error::GatewayResult;
use crate::models::result::SubmissionPayload;
use crate::models::wire::{
    parse_enrollment, parse_history, parse_questions, parse_quiz_list, parse_quiz_result,
};
use crate::models::{AttemptSummary, EnrollmentSet, PlayHistoryEntry, Question, Quiz, QuizResult};

#[async_trait]
pub trait QuizCatalog: Send + Sync {
    async fn list_quizzes(&self) -> GatewayResult<Vec<Quiz>>;

    async fn questions(&self, quiz_id: &str) -> GatewayResult<Vec<Question>>;

    /// Sends a finished attempt. Figures missing from the answer fall back
    /// to `summary`.
    async fn submit(
        &self,
        payload: &SubmissionPayload,
        summary: &AttemptSummary,
    ) -> GatewayResult<QuizResult>;
}

#[async_trait]
pub trait PlayHistorySource: Send + Sync {
    async fn play_history(&self) -> GatewayResult<Vec<PlayHistoryEntry>>;
}

#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    async fn enrollments(&self) -> GatewayResult<EnrollmentSet>;
}

#[derive(Clone, Debug)]
pub struct PortalClient {
    api: ApiClient,
}

impl PortalClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Fills in the questions of a catalog entry when the listing left them out.
    pub async fn with_questions(&self, mut quiz: Quiz) -> GatewayResult<Quiz> {
        if quiz.questions.is_empty() {
            quiz.questions = self.questions(&quiz.id).await?;
            if quiz.total_points == 0 {
                quiz.total_points = quiz.questions.iter().map(|q| q.points).sum();
            }
        }
        Ok(quiz)
    }
}

#[async_trait]
impl QuizCatalog for PortalClient {
    async fn list_quizzes(&self) -> GatewayResult<Vec<Quiz>> {
        let quizzes = parse_quiz_list(self.api.get_json(&["quiz"]).await?)?;
        tracing::debug!("Catalog returned {} quizzes", quizzes.len());
        Ok(quizzes)
    }

    async fn questions(&self, quiz_id: &str) -> GatewayResult<Vec<Question>> {
        parse_questions(self.api.get_json(&["quiz", quiz_id, "questions"]).await?)
    }

    async fn submit(
        &self,
        payload: &SubmissionPayload,
        summary: &AttemptSummary,
    ) -> GatewayResult<QuizResult> {
        let body = self.api.post_json(&["quiz", "submit"], payload).await?;
        let body = if body.is_null() { json!({}) } else { body };
        let result = parse_quiz_result(body, &payload.quiz_id, summary)?;
        tracing::info!(
            "Submitted quiz {}: {}% ({} / {})",
            result.quiz_id,
            result.percentage,
            result.correct_count,
            result.total_questions
        );
        Ok(result)
    }
}

#[async_trait]
impl PlayHistorySource for PortalClient {
    async fn play_history(&self) -> GatewayResult<Vec<PlayHistoryEntry>> {
        parse_history(self.api.get_json(&["quiz", "history"]).await?)
    }
}

#[async_trait]
impl EnrollmentSource for PortalClient {
    async fn enrollments(&self) -> GatewayResult<EnrollmentSet> {
        parse_enrollment(self.api.get_json(&["catalogue", "enrollments"]).await?)
    }
}

/// Fetches the three collaborators concurrently and applies the filter.
pub async fn playable_quizzes<C, H, E>(
    catalog: &C,
    history: &H,
    enrollment: &E,
    filter: &QuizFilter,
    points: u32,
) -> GatewayResult<Vec<Quiz>>
where
    C: QuizCatalog + ?Sized,
    H: PlayHistorySource + ?Sized,
    E: EnrollmentSource + ?Sized,
{
    let (all, history, enrollment) = futures::try_join!(
        catalog.list_quizzes(),
        history.play_history(),
        enrollment.enrollments()
    )?;
    Ok(filter.select(&all, &history, &enrollment, points))
}
