//! RSS 2.0 rendering of a curation result.
//!
//! Stories are split by script: Bangla headlines go to the native feed,
//! everything else to the overflow feed.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use common::OutputConfig;
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::info;

use crate::pipeline::CuratedStory;

const DEFAULT_NATIVE_FILE: &str = "filtered_feed.xml";
const DEFAULT_OVERFLOW_FILE: &str = "filtered_feed_overflow.xml";
const DEFAULT_CHANNEL_LINK: &str = "https://github.com/evilgodfahim";
const FEED_TIME_OFFSET_SECS: i32 = 6 * 3600;

/// What a feed file should say
#[derive(Debug, Clone, Copy)]
pub enum FeedContent<'a> {
    Stories(&'a [&'a CuratedStory]),
    /// Failed run; the message ends up in a single "System Error" item
    Error(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedLanguage {
    Bangla,
    English,
}

impl FeedLanguage {
    fn channel_title(self) -> &'static str {
        match self {
            FeedLanguage::Bangla => "Elite News Feed (Bangla)",
            FeedLanguage::English => "Elite News Feed (English)",
        }
    }
}

/// Resolved output locations
#[derive(Debug, Clone)]
pub struct FeedWriter {
    native_path: PathBuf,
    overflow_path: PathBuf,
    channel_link: String,
}

impl FeedWriter {
    pub fn from_config(config: &OutputConfig, dir_override: Option<&Path>) -> Self {
        let dir = dir_override
            .map(Path::to_path_buf)
            .or_else(|| config.dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            native_path: dir.join(config.native_file.as_deref().unwrap_or(DEFAULT_NATIVE_FILE)),
            overflow_path: dir.join(config.overflow_file.as_deref().unwrap_or(DEFAULT_OVERFLOW_FILE)),
            channel_link: config
                .channel_link
                .clone()
                .unwrap_or_else(|| DEFAULT_CHANNEL_LINK.to_string()),
        }
    }

    pub fn native_path(&self) -> &Path {
        &self.native_path
    }

    pub fn overflow_path(&self) -> &Path {
        &self.overflow_path
    }

    /// Write both feeds for a finished run.
    pub async fn write_stories(&self, stories: &[CuratedStory]) -> Result<()> {
        let (native, overflow): (Vec<&CuratedStory>, Vec<&CuratedStory>) =
            stories.iter().partition(|s| s.main.candidate.is_bangla());
        self.write(&self.native_path, FeedLanguage::Bangla, FeedContent::Stories(&native))
            .await?;
        self.write(&self.overflow_path, FeedLanguage::English, FeedContent::Stories(&overflow))
            .await?;
        info!(
            native = native.len(),
            overflow = overflow.len(),
            "feeds written"
        );
        Ok(())
    }

    /// Write both feeds in the error state.
    /// Writer with the built-in file names, for failures before the config is usable.
    pub fn fallback(dir_override: Option<&Path>) -> Self {
        Self::from_config(&OutputConfig::default(), dir_override)
    }

    pub async fn write_error(&self, message: &str) -> Result<()> {
        self.write(&self.native_path, FeedLanguage::Bangla, FeedContent::Error(message))
            .await?;
        self.write(&self.overflow_path, FeedLanguage::English, FeedContent::Error(message))
            .await
    }

    async fn write(&self, path: &Path, language: FeedLanguage, content: FeedContent<'_>) -> Result<()> {
        let xml = render_feed(language, &self.channel_link, content, Utc::now())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create output dir {}", parent.display()))?;
        }
        tokio::fs::write(path, xml)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn feed_time(at: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(FEED_TIME_OFFSET_SECS) {
        Some(offset) => at.with_timezone(&offset).to_rfc2822(),
        None => at.to_rfc2822(),
    }
}

/// Render one RSS document.
pub fn render_feed(
    language: FeedLanguage,
    channel_link: &str,
    content: FeedContent<'_>,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("rss").with_attributes([("version", "2.0")])))?;
    writer.write_event(Event::Start(BytesStart::new("channel")))?;

    text_element(&mut writer, "title", language.channel_title())?;
    text_element(&mut writer, "lastBuildDate", &feed_time(now))?;
    text_element(&mut writer, "link", channel_link)?;
    text_element(&mut writer, "description", "AI-curated structural news feed")?;

    match content {
        FeedContent::Error(message) => {
            status_item(&mut writer, "System Error", &format!("Script failed: {}", message), now)?;
        }
        FeedContent::Stories([]) => {
            status_item(&mut writer, "End of Feed", "No additional articles in this feed.", now)?;
        }
        FeedContent::Stories(stories) => {
            for story in stories {
                story_item(&mut writer, story)?;
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::End(BytesEnd::new("rss")))?;

    String::from_utf8(writer.into_inner().into_inner()).context("rendered feed is not UTF-8")
}

fn text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn status_item<W: std::io::Write>(writer: &mut Writer<W>, title: &str, description: &str, now: DateTime<Utc>) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("item")))?;
    text_element(writer, "title", title)?;
    text_element(writer, "description", description)?;
    text_element(writer, "pubDate", &feed_time(now))?;
    writer.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

fn story_item<W: std::io::Write>(writer: &mut Writer<W>, story: &CuratedStory) -> Result<()> {
    let main = &story.main;
    writer.write_event(Event::Start(BytesStart::new("item")))?;
    text_element(writer, "title", &main.candidate.title)?;
    text_element(writer, "link", main.candidate.link.as_str())?;
    text_element(writer, "pubDate", &feed_time(main.candidate.published_at))?;
    text_element(writer, "description", &story_description(story))?;
    writer.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

/// HTML body shown by feed readers for one story.
pub fn story_description(story: &CuratedStory) -> String {
    let main = &story.main;
    let voters = if main.selected_by.is_empty() {
        "Unknown".to_string()
    } else {
        main.selected_by.join(", ")
    };

    let mut html = format!(
        "<p><b>[{}]</b></p><p><i>{}</i></p><p><small>Selected by: {}</small></p><hr/><p>{}</p>",
        escape(main.category.as_str()),
        escape(main.reason.as_str()),
        escape(voters.as_str()),
        main.candidate.description
    );

    if !story.related.is_empty() {
        html.push_str("<hr/><p><b>Similar items:</b></p><ul>");
        for item in &story.related {
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a></li>",
                escape(item.candidate.link.as_str()),
                escape(item.candidate.title.as_str())
            ));
        }
        html.push_str("</ul>");
    }
    html
}
