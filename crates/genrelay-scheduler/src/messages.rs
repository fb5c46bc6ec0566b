//! Texts sent to end users. Messages are rendered as Telegram HTML.

pub const BUSY: &str = "The queue is very long right now. Please try again later.";
pub const INTERNAL_ERROR: &str = "Something went wrong. Please try again later.";
pub const STARTED: &str = "Generation started. The result will arrive here as soon as it is ready.";
pub const TIMED_OUT: &str = "Generation took too long and was cancelled. Please try again.";
pub const DELIVERY_FAILED: &str = "The result is ready but could not be sent. Please try again.";

pub fn unknown_model(model_key: &str) -> String {
    format!("Unknown model: <code>{}</code>", escape_html(model_key))
}

pub fn no_provider(model_key: &str) -> String {
    format!("No handler for model: <code>{}</code>", escape_html(model_key))
}

pub fn generation_failed(prompt: &str) -> String {
    format!(
        "Generation failed! Please try again.\n\nPrompt:\n<code>{}</code>",
        escape_html(prompt)
    )
}

/// `fraction` is upstream progress in `0.0..=1.0`.
pub fn progress(fraction: f64) -> String {
    let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u32;
    format!("Generation in progress: {percent}%")
}

pub fn ready(result: &str) -> String {
    format!("Your result is ready:\n{}", escape_html(result))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}
