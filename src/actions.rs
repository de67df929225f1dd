//! Built-in action sets. Each `register_*` function wires one bundle of
//! domain actions into a registry; handlers capture their store paths and
//! logs at registration time, so a registry is self-contained once built.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use tracing::info;

use crate::agent::{ActionResult, AgentError};
use crate::browser::Locator;
use crate::records::{DocEntry, JobRecord, ScheduledPost, DOC_KEY, POST_KEY};
use crate::registry::{ActionRegistry, NoParams};
use crate::store::{CsvLog, DocStore, Document, UpsertOutcome};

pub const JOB_CSV_HEADER: &[&str] = &["Title", "Company", "Link", "Salary", "Location", "FitScore"];

// ========================= Browser Actions =========================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NavigateParams {
    pub url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClickParams {
    pub target: Locator,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InputTextParams {
    pub target: Locator,
    pub text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UploadParams {
    pub target: Locator,
    pub path: String,
}

pub fn register_browser_actions(reg: &mut ActionRegistry) -> Result<(), AgentError> {
    reg.register_with_browser::<NavigateParams, _, _>(
        "navigate",
        "Navigate the browser to a specific URL",
        |p: NavigateParams, driver| async move {
            driver.navigate(&p.url).await?;
            Ok(ActionResult::content(format!("Navigated to {}", p.url)))
        },
    )?;

    reg.register_with_browser::<ClickParams, _, _>(
        "click_element",
        "Click the element matched by the locator",
        |p: ClickParams, driver| async move {
            driver.click(&p.target).await?;
            Ok(ActionResult::ok())
        },
    )?;

    reg.register_with_browser::<InputTextParams, _, _>(
        "input_text",
        "Type text into the element matched by the locator",
        |p: InputTextParams, driver| async move {
            driver.type_text(&p.target, &p.text).await?;
            Ok(ActionResult::ok())
        },
    )?;

    reg.register_with_browser::<UploadParams, _, _>(
        "upload_file",
        "Upload a local file into the matched file input",
        |p: UploadParams, driver| async move {
            driver.upload(&p.target, &p.path).await?;
            Ok(ActionResult::content(format!("Uploaded {}", p.path)))
        },
    )?;

    reg.register_with_browser::<NoParams, _, _>(
        "extract_page",
        "Extract the current page's visible text",
        |_p, driver| async move {
            let snapshot = driver.extract().await?;
            let url = snapshot.url.unwrap_or_default();
            Ok(ActionResult::content(format!("url: {}\n{}", url, snapshot.text)))
        },
    )?;

    Ok(())
}

// ========================= Job-Hunt Actions =========================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UploadResumeParams {
    /// Element index of the file input; retry nearby indexes when it misses.
    pub index: usize,
}

pub fn register_job_actions(
    reg: &mut ActionRegistry,
    log: CsvLog,
    resume_path: impl AsRef<Path>,
) -> Result<(), AgentError> {
    let log = Arc::new(log);
    let resume_path: PathBuf = resume_path.as_ref().to_path_buf();

    {
        let log = log.clone();
        reg.register::<JobRecord, _, _>(
            "save_job",
            "Save a job listing with a score for how well it fits the profile",
            move |job: JobRecord| {
                let log = log.clone();
                async move {
                    log.append(&[
                        job.title.clone(),
                        job.company.clone(),
                        job.link.clone(),
                        job.salary.clone().unwrap_or_default(),
                        job.location.clone().unwrap_or_default(),
                        format!("{:.2}", job.fit_score),
                    ])?;
                    Ok(ActionResult::content(format!(
                        "Saved job '{}' at {}",
                        job.title, job.company
                    )))
                }
            },
        )?;
    }

    {
        let log = log.clone();
        reg.register::<NoParams, _, _>(
            "read_jobs",
            "Read all saved job listings",
            move |_| {
                let log = log.clone();
                async move {
                    match log.read_to_string()? {
                        Some(text) => Ok(ActionResult::content(text)),
                        None => Ok(ActionResult::content("No jobs saved yet.")),
                    }
                }
            },
        )?;
    }

    {
        let path = resume_path.clone();
        reg.register::<NoParams, _, _>(
            "read_resume",
            "Read the resume for context when filling forms",
            move |_| {
                let path = path.clone();
                async move {
                    let text = async_fs::read_to_string(&path)
                        .await
                        .map_err(|e| AgentError::Store(format!("read {}: {}", path.display(), e)))?;
                    info!(chars = text.len(), "read resume");
                    Ok(ActionResult::retained(text))
                }
            },
        )?;
    }

    {
        let path = resume_path;
        reg.register_with_browser::<UploadResumeParams, _, _>(
            "upload_resume",
            "Upload the resume to the file input at the given element index",
            move |p: UploadResumeParams, driver| {
                let path = path.clone();
                async move {
                    let target = Locator::Index { index: p.index };
                    if !driver.locate(&target).await? {
                        return Ok(ActionResult::failure(format!(
                            "no element found at index {}",
                            p.index
                        )));
                    }
                    driver.upload(&target, &path.display().to_string()).await?;
                    Ok(ActionResult::content(format!(
                        "Uploaded resume to element {}",
                        p.index
                    )))
                }
            },
        )?;
    }

    Ok(())
}

// ========================= Calendar Actions =========================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdatePostStatusParams {
    pub platform: String,
    pub scheduled_time: String,
    /// New status, e.g. "published" or "failed".
    pub status: String,
    #[serde(default)]
    pub post_url: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EngagementParams {
    pub platform: String,
    pub post_url: String,
    /// Engagement metrics as reported by the platform (likes, shares, ...).
    pub metrics: Value,
}

pub fn register_calendar_actions(
    reg: &mut ActionRegistry,
    store: Arc<DocStore>,
    path: impl AsRef<Path>,
) -> Result<(), AgentError> {
    let path: PathBuf = path.as_ref().to_path_buf();

    {
        let store = store.clone();
        let path = path.clone();
        reg.register::<NoParams, _, _>(
            "load_calendar",
            "Load the content calendar, creating it if absent",
            move |_| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let doc: Document<ScheduledPost> = store.load(&path).await?;
                    let body = serde_json::to_string_pretty(&doc)
                        .map_err(|e| AgentError::Store(e.to_string()))?;
                    Ok(ActionResult::retained(body))
                }
            },
        )?;
    }

    {
        let store = store.clone();
        let path = path.clone();
        reg.register::<ScheduledPost, _, _>(
            "add_post",
            "Add a post to the content calendar; a post already scheduled for the same platform and time is replaced",
            move |post: ScheduledPost| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let platform = post.platform.clone();
                    let when = post.scheduled_time.clone();
                    let outcome = store.upsert(&path, post, POST_KEY).await?;
                    let verb = match outcome {
                        UpsertOutcome::Appended => "Added",
                        UpsertOutcome::Replaced => "Replaced",
                    };
                    Ok(ActionResult::content(format!(
                        "{} post for {} scheduled at {}",
                        verb, platform, when
                    )))
                }
            },
        )?;
    }

    {
        let store = store.clone();
        let path = path.clone();
        reg.register::<UpdatePostStatusParams, _, _>(
            "update_post_status",
            "Update the status of a calendar post after a publishing attempt",
            move |p: UpdatePostStatusParams| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let mut doc: Document<ScheduledPost> = store.load(&path).await?;
                    let Some(post) = doc.records.iter_mut().find(|post| {
                        post.platform == p.platform && post.scheduled_time == p.scheduled_time
                    }) else {
                        return Ok(ActionResult::failure(format!(
                            "no matching post for {} at {}",
                            p.platform, p.scheduled_time
                        )));
                    };
                    post.status = p.status.clone();
                    if p.post_url.is_some() {
                        post.post_url = p.post_url.clone();
                    }
                    store.save(&path, doc).await?;
                    Ok(ActionResult::content(format!(
                        "Updated post status to {}",
                        p.status
                    )))
                }
            },
        )?;
    }

    {
        let store = store;
        let path = path;
        reg.register::<EngagementParams, _, _>(
            "save_engagement",
            "Save engagement metrics for a published post",
            move |p: EngagementParams| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let mut doc: Document<ScheduledPost> = store.load(&path).await?;
                    let Some(post) = doc.records.iter_mut().find(|post| {
                        post.platform == p.platform
                            && post.post_url.as_deref() == Some(p.post_url.as_str())
                    }) else {
                        return Ok(ActionResult::failure(format!(
                            "no matching post for {} at URL {}",
                            p.platform, p.post_url
                        )));
                    };
                    post.engagement = Some(p.metrics);
                    store.save(&path, doc).await?;
                    Ok(ActionResult::content(format!(
                        "Saved engagement metrics for {} post",
                        p.platform
                    )))
                }
            },
        )?;
    }

    Ok(())
}

// ========================= Docs Actions =========================

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct GuideParams {
    /// Restrict the guide to these frameworks; omit for all.
    #[serde(default)]
    pub frameworks: Option<Vec<String>>,
    /// Restrict the guide to these topics; omit for all.
    #[serde(default)]
    pub topics: Option<Vec<String>>,
}

pub fn register_docs_actions(
    reg: &mut ActionRegistry,
    store: Arc<DocStore>,
    library_path: impl AsRef<Path>,
    guide_path: impl AsRef<Path>,
) -> Result<(), AgentError> {
    let library_path: PathBuf = library_path.as_ref().to_path_buf();
    let guide_path: PathBuf = guide_path.as_ref().to_path_buf();

    {
        let store = store.clone();
        let path = library_path.clone();
        reg.register::<NoParams, _, _>(
            "load_doc_library",
            "Load the documentation library, creating it if absent",
            move |_| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let doc: Document<DocEntry> = store.load(&path).await?;
                    let body = serde_json::to_string_pretty(&doc)
                        .map_err(|e| AgentError::Store(e.to_string()))?;
                    Ok(ActionResult::retained(body))
                }
            },
        )?;
    }

    {
        let store = store.clone();
        let path = library_path.clone();
        reg.register::<DocEntry, _, _>(
            "add_doc_entry",
            "Add a documentation entry to the library; an entry for the same framework and topic is replaced",
            move |entry: DocEntry| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let framework = entry.framework.clone();
                    let topic = entry.topic.clone();
                    store.upsert(&path, entry, DOC_KEY).await?;
                    Ok(ActionResult::content(format!(
                        "Saved documentation for {} / {}",
                        framework, topic
                    )))
                }
            },
        )?;
    }

    {
        reg.register::<GuideParams, _, _>(
            "generate_reference_guide",
            "Render the documentation library (optionally filtered by framework or topic) to a Markdown reference guide",
            move |p: GuideParams| {
                let store = store.clone();
                let library = library_path.clone();
                let guide = guide_path.clone();
                async move {
                    let entries: Vec<DocEntry> = store
                        .query(&library, |e: &DocEntry| {
                            p.frameworks.as_ref().map_or(true, |f| f.contains(&e.framework))
                                && p.topics.as_ref().map_or(true, |t| t.contains(&e.topic))
                        })
                        .await?;
                    if entries.is_empty() {
                        return Ok(ActionResult::content(
                            "No matching entries found for the specified filters.",
                        ));
                    }
                    let markdown = render_guide(&entries);
                    if let Some(parent) = guide.parent() {
                        if !parent.as_os_str().is_empty() {
                            async_fs::create_dir_all(parent).await.map_err(|e| {
                                AgentError::Store(format!("create_dir {}: {}", parent.display(), e))
                            })?;
                        }
                    }
                    async_fs::write(&guide, markdown)
                        .await
                        .map_err(|e| AgentError::Store(format!("write {}: {}", guide.display(), e)))?;
                    Ok(ActionResult::content(format!(
                        "Wrote reference guide covering {} entries to {}",
                        entries.len(),
                        guide.display()
                    )))
                }
            },
        )?;
    }

    Ok(())
}

/// Group entries by framework in first-seen order and render the guide.
fn render_guide(entries: &[DocEntry]) -> String {
    let mut groups: Vec<(&str, Vec<&DocEntry>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(fw, _)| *fw == entry.framework) {
            Some((_, list)) => list.push(entry),
            None => groups.push((entry.framework.as_str(), vec![entry])),
        }
    }

    let mut md = String::from("# Technical Reference Guide\n\n");
    md.push_str(&format!("*Generated on {}*\n\n", crate::store::now_iso()));

    md.push_str("## Table of Contents\n\n");
    for (framework, list) in &groups {
        md.push_str(&format!("- [{}](#{})\n", framework, anchor(framework)));
        for entry in list {
            md.push_str(&format!("  - {}\n", entry.topic));
        }
    }
    md.push('\n');

    for (framework, list) in &groups {
        md.push_str(&format!("## {}\n\n", framework));
        for entry in list {
            md.push_str(&format!("### {}\n\n", entry.topic));
            md.push_str(&format!("{}\n\n", entry.description));
            for example in &entry.code_examples {
                md.push_str(&format!("**Example: {}**\n\n", example.title));
                md.push_str("```\n");
                md.push_str(&example.code);
                if !example.code.ends_with('\n') {
                    md.push('\n');
                }
                md.push_str("```\n\n");
                if let Some(explanation) = &example.explanation {
                    md.push_str(&format!("{}\n\n", explanation));
                }
            }
            if let Some(api) = &entry.api_reference {
                md.push_str(&format!("**API Reference**: {}\n\n", api));
            }
            md.push_str(&format!("[Source]({})\n\n", entry.source_url));
        }
    }
    md
}

fn anchor(heading: &str) -> String {
    heading.to_lowercase().replace(' ', "-")
}

// ========================= Report Action =========================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SaveReportParams {
    /// Full Markdown content, title included.
    pub content: String,
}

pub fn register_report_action(
    reg: &mut ActionRegistry,
    path: impl AsRef<Path>,
) -> Result<(), AgentError> {
    let path: PathBuf = path.as_ref().to_path_buf();
    reg.register::<SaveReportParams, _, _>(
        "save_report",
        "Save the finished Markdown report to a file",
        move |p: SaveReportParams| {
            let path = path.clone();
            async move {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        async_fs::create_dir_all(parent).await.map_err(|e| {
                            AgentError::Store(format!("create_dir {}: {}", parent.display(), e))
                        })?;
                    }
                }
                async_fs::write(&path, p.content)
                    .await
                    .map_err(|e| AgentError::Store(format!("write {}: {}", path.display(), e)))?;
                Ok(ActionResult::content(format!("Saved report to {}", path.display())))
            }
        },
    )
}
