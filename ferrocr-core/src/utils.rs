use std::{
    fs::{create_dir, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use colored::*;
use serde::Serialize;

use crate::render::MarkdownDocument;

pub const FIGURES_DIR: &str = "figures";

pub fn sanitize_doc_name(doc_name: &str) -> String {
    doc_name
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
}

fn recreate_result_dir(result_dir_name: &Path) -> anyhow::Result<PathBuf> {
    if std::fs::create_dir_all(result_dir_name).is_ok()
        && std::fs::read_dir(result_dir_name)?.next().is_none()
    {
        return Ok(result_dir_name.to_owned());
    }
    std::fs::remove_dir_all(result_dir_name)?;
    std::fs::create_dir_all(result_dir_name)?;
    Ok(result_dir_name.to_owned())
}

/// Creates a fresh `<output_dir>/<doc>-results` directory, with a `figures`
/// subdirectory when asked.
pub fn create_dirs<P: AsRef<Path>>(
    output_dir: Option<P>,
    doc_name: &str,
    save_figures: bool,
) -> anyhow::Result<PathBuf> {
    let result_dir_name = format!("{}-results", sanitize_doc_name(doc_name));
    let res_dir_path = match output_dir {
        Some(p) => p.as_ref().join(&result_dir_name),
        None => PathBuf::from(".").join(&result_dir_name),
    };
    let res_dir_path = recreate_result_dir(&res_dir_path)
        .with_context(|| format!("can't create {}", res_dir_path.display()))?;
    if save_figures {
        create_dir(res_dir_path.join(FIGURES_DIR)).context("cant create figures path")?;
    }
    Ok(res_dir_path)
}

/// Writes `<doc>.json`, plus `<doc>.md` and its figures when a markdown
/// document is given.
pub fn save_results<T: Serialize>(
    doc_name: &str,
    results: &T,
    markdown: Option<&MarkdownDocument>,
    res_dir_path: &Path,
) -> anyhow::Result<()> {
    let sanitized_doc_name = sanitize_doc_name(doc_name);

    let file_out = res_dir_path.join(format!("{}.json", &sanitized_doc_name));
    let file = File::create(&file_out)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, results)?;
    writer.flush()?;

    if let Some(doc) = markdown {
        if !doc.images.is_empty() {
            let fig_dir = res_dir_path.join(FIGURES_DIR);
            std::fs::create_dir_all(&fig_dir)?;
            for (name, bytes) in &doc.images {
                std::fs::write(fig_dir.join(name), bytes)
                    .with_context(|| format!("can't save figure {name}"))?;
            }
        }
        let md_file_out = res_dir_path.join(format!("{}.md", sanitized_doc_name));
        let file = File::create(&md_file_out)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(doc.markdown.as_bytes())?;
        writer.flush()?;
    }

    println!(
        "{} Results saved in: {}",
        "✓".green().bold(),
        res_dir_path.display().to_string().cyan().underline()
    );

    Ok(())
}
