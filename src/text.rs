/// Placeholder the processor expands into the image feature tokens.
pub const IMAGE_TOKEN: &str = "<image>";

/// Wraps a user prompt into the chat format the model was tuned on.
pub fn chat_prompt(user_prompt: &str) -> String {
    format!("<|im_start|>user{IMAGE_TOKEN}\n{user_prompt}<|im_end|><|im_start|>assistant")
}

/// Greedily packs whitespace separated words into lines of at most `width`
/// characters.
///
/// Words are never split: a word longer than `width` ends up alone on its own
/// line. Line breaks, tabs and repeated spaces in the input are collapsed.
pub fn wrap_text(text: &str, width: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut line_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if line.is_empty() {
            line.push_str(word);
            line_len = word_len;
        } else if line_len + 1 + word_len <= width {
            line.push(' ');
            line.push_str(word);
            line_len += 1 + word_len;
        } else {
            lines.push(std::mem::take(&mut line));
            line.push_str(word);
            line_len = word_len;
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }

    lines.join("\n")
}
