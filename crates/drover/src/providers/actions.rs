use regex::Regex;

use super::base::Action;

/// Extract shell actions from fenced ```bash blocks in an assistant reply.
///
/// Heredoc-aware: a block whose body ends in a heredoc terminator (`EOF`)
/// is matched through the terminator first, so ```bash fences appearing
/// inside the heredoc body are not split into separate actions.
pub fn extract_actions(text: &str) -> Vec<Action> {
    let heredoc_content = Regex::new(r"(?s)```bash\n(.*?\nEOF)\n```").expect("valid regex");
    let heredoc_block = Regex::new(r"(?s)```bash\n.*?\nEOF\n```").expect("valid regex");
    let plain = Regex::new(r"(?s)```bash\n(.*?)\n```").expect("valid regex");

    let heredocs: Vec<String> = heredoc_content
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();

    let mut commands = if heredocs.is_empty() {
        plain
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect()
    } else {
        let mut commands = heredocs;
        // Blocks appearing after the first heredoc block are separate
        // top-level actions again.
        if let Some(m) = heredoc_block.find(text) {
            let rest = &text[m.end()..];
            commands.extend(plain.captures_iter(rest).map(|c| c[1].to_string()));
        }
        commands
    };

    commands.retain(|c| !c.trim().is_empty());
    commands
        .into_iter()
        .map(|c| Action::new(c.trim()))
        .collect()
}
