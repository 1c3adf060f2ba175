//! Prompt text sent to the collaborator.

use crate::state_machine::MatchAnalysis;

pub const ANALYSIS_SYSTEM: &str = "You are a careful recruiting analyst. \
You compare a candidate's material with a job posting and answer with JSON only.";

pub const DOCUMENT_SYSTEM: &str = "You write application documents for a candidate. \
You may only reorganize and re-emphasize facts present in the candidate's material. \
Never invent experience, skills, employers, dates, or credentials.";

pub fn match_analysis(subject: &str, target: &str) -> String {
    format!(
        "Analyze how well this candidate matches the job and respond with ONLY valid JSON, no other text.\n\
         \n\
         Format:\n\
         {{\"match_score\": <integer 0-100>, \"key_strengths\": [\"...\"], \"gaps\": [\"...\"], \
         \"recommendations\": [\"...\"], \"should_apply\": <true|false>, \"reasoning\": \"<brief explanation>\"}}\n\
         \n\
         JOB POSTING:\n{target}\n\
         \n\
         CANDIDATE MATERIAL:\n{subject}"
    )
}

pub fn cover_letter(subject: &str, target: &str, analysis: &MatchAnalysis) -> String {
    let strengths = bullet_list(&analysis.strengths);
    let gaps = bullet_list(&analysis.gaps);
    format!(
        "Write a cover letter for this application and respond with ONLY valid JSON, no other text.\n\
         \n\
         Format:\n\
         {{\"document\": \"<the letter>\", \"emphasized\": [\"<fact from the candidate material the letter leans on>\"]}}\n\
         \n\
         Requirements:\n\
         1. Professional tone, 250-350 words\n\
         2. Be specific about how the candidate's skills match the role\n\
         3. Lean on these strengths:\n{strengths}\n\
         4. Address these gaps honestly, without claiming skills the candidate lacks:\n{gaps}\n\
         5. DO NOT invent experience or skills that are not in the candidate material\n\
         \n\
         JOB POSTING:\n{target}\n\
         \n\
         CANDIDATE MATERIAL:\n{subject}"
    )
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "   - (none identified)".to_string();
    }
    items
        .iter()
        .map(|item| format!("   - {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
