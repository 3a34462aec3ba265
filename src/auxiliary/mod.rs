//! Small stores layered on the same database as the memory table:
//! semantic-searchable skill prompts, exact-match context rules, and the
//! installed-skill registry.

pub mod context_rules;
pub mod skill_prompts;
pub mod skills;

pub use context_rules::ContextRuleStore;
pub use skill_prompts::SkillPromptStore;
pub use skills::SkillRegistry;
