use scriptbot_plugin_sdk::BackendKind;

/// The `format` module: chat markup for the host's backend. TeamSpeak takes
/// BBCode, Discord takes Markdown.
pub struct FormatNamespace {
    backend: BackendKind,
}

impl FormatNamespace {
    pub(crate) fn new(backend: BackendKind) -> Self {
        Self { backend }
    }

    pub fn bold(&self, text: &str) -> String {
        self.wrap(text, "[b]", "[/b]", "**")
    }

    pub fn italic(&self, text: &str) -> String {
        self.wrap(text, "[i]", "[/i]", "*")
    }

    pub fn underline(&self, text: &str) -> String {
        self.wrap(text, "[u]", "[/u]", "__")
    }

    pub fn code(&self, text: &str) -> String {
        match self.backend {
            BackendKind::Ts3 => format!("[code]{text}[/code]"),
            BackendKind::Discord if text.contains('\n') => format!("```\n{text}\n```"),
            BackendKind::Discord => format!("`{text}`"),
        }
    }

    /// `color` is a hex code such as `#ff0000`. Discord has no coloured
    /// text, so the text comes back unchanged there.
    pub fn color(&self, text: &str, color: &str) -> String {
        match self.backend {
            BackendKind::Ts3 => format!("[color={color}]{text}[/color]"),
            BackendKind::Discord => text.to_string(),
        }
    }

    fn wrap(&self, text: &str, open: &str, close: &str, markdown: &str) -> String {
        match self.backend {
            BackendKind::Ts3 => format!("{open}{text}{close}"),
            BackendKind::Discord => format!("{markdown}{text}{markdown}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teamspeak_uses_bbcode() {
        let format = FormatNamespace::new(BackendKind::Ts3);
        assert_eq!(format.bold("hi"), "[b]hi[/b]");
        assert_eq!(format.underline("hi"), "[u]hi[/u]");
        assert_eq!(format.color("hi", "#ff0000"), "[color=#ff0000]hi[/color]");
    }

    #[test]
    fn discord_uses_markdown_and_drops_colour() {
        let format = FormatNamespace::new(BackendKind::Discord);
        assert_eq!(format.italic("hi"), "*hi*");
        assert_eq!(format.code("x = 1"), "`x = 1`");
        assert_eq!(format.code("a\nb"), "```\na\nb\n```");
        assert_eq!(format.color("hi", "#ff0000"), "hi");
    }
}
