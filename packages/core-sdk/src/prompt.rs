use crate::models::{CreativeDirection, GenerationMode, RewriteScope};

/** \brief 续写时随请求附带的故事末尾字符数上限。 */
pub const CONTINUE_CONTEXT_CHARS: usize = 8000;

const BASE_INSTRUCTION: &str = "You are a skilled creative-writing partner. \
Write vivid, coherent prose that keeps characters, tense and point of view consistent. \
Reply with story text only: no headings, no commentary, no markdown.";

/**
 * \brief 单次生成的提示输入。
 */
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub mode: GenerationMode,
    /** \brief 全文（续写、整篇改写时使用） */
    pub story_text: &'a str,
    /** \brief 选中的章节（章节改写时使用） */
    pub chapter: Option<&'a str>,
    /** \brief 用户本轮的额外要求 */
    pub user_prompt: Option<&'a str>,
    pub direction: &'a CreativeDirection,
}

/**
 * \brief 按模式生成系统指令。
 */
pub fn system_instruction(mode: GenerationMode) -> String {
    let task = match mode {
        GenerationMode::Continue => {
            "When asked to continue, pick up exactly where the text stops and write the next passage."
        }
        GenerationMode::Rewrite(RewriteScope::EntireStory) => {
            "When asked to rewrite, return the complete story rewritten, preserving its plot unless told otherwise."
        }
        GenerationMode::Rewrite(RewriteScope::SelectedChapter) => {
            "When asked to rewrite, return only the selected chapter rewritten so it still fits the surrounding story."
        }
    };
    format!("{} {}", BASE_INSTRUCTION, task)
}

/**
 * \brief 把故事正文、创作方向与任务说明折叠成一条用户消息。
 */
pub fn build_user_message(input: &PromptInput<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    match input.mode {
        GenerationMode::Continue => {
            let tail = tail_chars(input.story_text, CONTINUE_CONTEXT_CHARS);
            if !tail.trim().is_empty() {
                sections.push(format!("## Story so far\n{}", tail.trim_end()));
            }
        }
        GenerationMode::Rewrite(RewriteScope::EntireStory) => {
            sections.push(format!("## Story\n{}", input.story_text.trim_end()));
        }
        GenerationMode::Rewrite(RewriteScope::SelectedChapter) => {
            let chapter = input.chapter.unwrap_or_default();
            sections.push(format!("## Selected chapter\n{}", chapter.trim_end()));
        }
    }

    if let Some(direction) = direction_section(input.direction) {
        sections.push(direction);
    }
    if let Some(characters) = characters_section(input.direction) {
        sections.push(characters);
    }
    if let Some(extra) = non_blank(input.direction.instructions.as_deref()) {
        sections.push(format!("## Additional instructions\n{}", extra));
    }

    let task = match input.mode {
        GenerationMode::Continue if input.story_text.trim().is_empty() => {
            "Begin a new story.".to_string()
        }
        GenerationMode::Continue => "Continue the story from where it stops.".to_string(),
        GenerationMode::Rewrite(RewriteScope::EntireStory) => "Rewrite the story.".to_string(),
        GenerationMode::Rewrite(RewriteScope::SelectedChapter) => {
            "Rewrite the selected chapter.".to_string()
        }
    };
    let task = match non_blank(input.user_prompt) {
        Some(prompt) => format!("{}\n{}", task, prompt),
        None => task,
    };
    sections.push(format!("## Task\n{}", task));

    sections.join("\n\n")
}

fn direction_section(direction: &CreativeDirection) -> Option<String> {
    let lines: Vec<String> = [
        ("Genre", direction.genre.as_deref()),
        ("Tone", direction.tone.as_deref()),
        ("Style", direction.style.as_deref()),
        ("Point of view", direction.point_of_view.as_deref()),
    ]
    .iter()
    .filter_map(|(label, value)| non_blank(*value).map(|v| format!("{}: {}", label, v)))
    .collect();
    if lines.is_empty() {
        None
    } else {
        Some(format!("## Creative direction\n{}", lines.join("\n")))
    }
}

fn characters_section(direction: &CreativeDirection) -> Option<String> {
    let lines: Vec<String> = direction
        .characters
        .iter()
        .filter(|c| !c.name.trim().is_empty())
        .map(|c| match non_blank(Some(c.description.as_str())) {
            Some(desc) => format!("- {}: {}", c.name.trim(), desc),
            None => format!("- {}", c.name.trim()),
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(format!("## Characters\n{}", lines.join("\n")))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/**
 * \brief 取末尾最多 max 个字符（按字符而非字节截断）。
 */
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let byte_index = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[byte_index..]
}
