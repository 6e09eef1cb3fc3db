use minijinja::{context, Environment, Value};

use crate::types::Article;

const SENTIMENT_TEMPLATE: &str = include_str!("prompts/sentiment.j2");
const SUGGESTIONS_TEMPLATE: &str = include_str!("prompts/suggestions.j2");
const ORACLE_TEMPLATE: &str = include_str!("prompts/oracle.j2");

pub const MAX_SUGGESTIONS: usize = 5;

fn render(name: &str, source: &str, ctx: Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    template.render(ctx).ok()
}

pub fn render_sentiment_prompt() -> String {
    render("sentiment", SENTIMENT_TEMPLATE, context! {})
        .unwrap_or_else(fallback_sentiment_prompt)
}

fn fallback_sentiment_prompt() -> String {
    "Score the sentiment of the customer message. Reply with JSON \
     {\"sentimentScore\": -1..1, \"confidenceIndex\": 0..1}."
        .to_string()
}

pub fn render_suggestions_prompt(articles: &[Article]) -> String {
    render(
        "suggestions",
        SUGGESTIONS_TEMPLATE,
        context! {
            articles => articles,
            limit => MAX_SUGGESTIONS,
        },
    )
    .unwrap_or_else(|| fallback_suggestions_prompt(articles))
}

fn fallback_suggestions_prompt(articles: &[Article]) -> String {
    let mut prompt = String::from(
        "Pick the knowledge-base articles relevant to the conversation.\nArticles:\n",
    );
    for article in articles {
        prompt.push_str(&format!("- {}: {}\n", article.id, article.title));
    }
    prompt.push_str(
        "Reply with JSON {\"suggestions\": [{\"id\": \"...\", \"relevanceScore\": 0..1}]}.",
    );
    prompt
}

pub fn render_oracle_prompt(corpus: &str) -> String {
    render(
        "oracle",
        ORACLE_TEMPLATE,
        context! { corpus => corpus.trim() },
    )
    .unwrap_or_else(|| fallback_oracle_prompt(corpus))
}

fn fallback_oracle_prompt(corpus: &str) -> String {
    format!(
        "Answer the agent's question using only this knowledge base:\n{}\n",
        corpus.trim()
    )
}
