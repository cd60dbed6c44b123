// Instruction augmentation with language-specific guidance

use super::language::Language;

const RUST_GUIDANCE: &str = "Follow Rust best practices: use Result/Option for error handling, \
implement proper error types, add documentation with ///, use pattern matching with match, \
and follow ownership rules.";

const ELIXIR_GUIDANCE: &str = "Follow Elixir best practices: use pattern matching, \
implement proper error handling with {:ok, result} and {:error, reason}, add @doc documentation, \
use the pipe operator |> for data transformation, and follow OTP patterns.";

/// Append the guidance checklist for `language` to `instruction`
///
/// Not idempotent: augmenting twice appends the checklist twice.
pub fn augment_instruction(instruction: &str, language: Language) -> String {
    let guidance = match language {
        Language::Rust => RUST_GUIDANCE,
        Language::Elixir => ELIXIR_GUIDANCE,
        Language::Unknown => return instruction.to_string(),
    };
    format!("{}\n\n{}", instruction, guidance)
}
