//! The `apt` distribution adapter: Debian/Ubuntu-style `Contents-<arch>.gz` indices.

use std::io::{BufRead, BufReader, Read};

use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::PackagingConfig;
use crate::containers::ContainerHandle;
use crate::package_manager::{ContentIndexEntry, PackageManager};

const MIRROR: &str = "http://security.ubuntu.com/ubuntu/dists";

pub struct Apt {
    config: PackagingConfig,
}

impl Apt {
    pub fn new(config: PackagingConfig) -> Self {
        Self { config }
    }

    fn contents_url(&self) -> String {
        format!(
            "{MIRROR}/{}/Contents-{}.gz",
            self.config.os_version, self.config.arch
        )
    }
}

impl PackageManager for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn config(&self) -> &PackagingConfig {
        &self.config
    }

    fn update(&self, container: &ContainerHandle) -> Result<(i32, Vec<u8>), anyhow::Error> {
        container.exec("apt-get update -y")
    }

    fn install(
        &self,
        container: &ContainerHandle,
        packages: &[String],
    ) -> Result<(i32, Vec<u8>), anyhow::Error> {
        if packages.is_empty() {
            return Ok((0, Vec::new()));
        }
        container.exec(&format!("apt-get -y install {}", packages.join(" ")))
    }

    fn iter_packages(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<ContentIndexEntry, anyhow::Error>>>, anyhow::Error>
    {
        let url = self.contents_url();
        tracing::info!("downloading {url}\nthis is a one-time download and may take a few minutes.");

        let response = ureq::get(&url).call().map_err(|e| match e {
            ureq::Error::Status(404, _) => anyhow::anyhow!(
                "received an HTTP 404 error when trying to download the package database for \
                 {}:{}-{} from {url}",
                self.config.os,
                self.config.os_version,
                self.config.arch
            ),
            other => anyhow::anyhow!(
                "error trying to download the package database for {}:{}-{} from {url}: {other}",
                self.config.os,
                self.config.os_version,
                self.config.arch
            ),
        })?;

        let content_length: u64 = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let bar = ProgressBar::new(content_length);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message("Contents index");

        let reader = ProgressRead {
            inner: response.into_reader(),
            bar: bar.clone(),
        };
        let decoder = GzDecoder::new(reader);
        let lines = BufReader::new(decoder).lines();

        // Ubuntu's Contents index omits /usr/bin/cc; inject the synthetic mapping the
        // original tool carried so that `cc` resolves to a toolchain package.
        let synthetic = std::iter::once(Ok(ContentIndexEntry {
            filename: "usr/bin/cc".to_string(),
            packages: vec!["gcc".to_string(), "g++".to_string(), "clang".to_string()],
        }));

        let parsed = lines.map(move |line| -> Result<ContentIndexEntry, anyhow::Error> {
            let line = line?;
            parse_contents_line(&line)
        });

        Ok(Box::new(synthetic.chain(parsed).inspect(move |_| {
            if bar.position() >= content_length && content_length > 0 {
                bar.finish_and_clear();
            }
        })))
    }

    fn versions(&self) -> Result<Vec<PackagingConfig>, anyhow::Error> {
        let index = ureq::get(MIRROR).call()?.into_string()?;
        let mut configs = Vec::new();
        for subdir in extract_hrefs(&index).into_iter().filter(|h| h.ends_with('/')) {
            let subdir_name = subdir.trim_end_matches('/').to_string();
            let subdir_url = format!("{MIRROR}/{subdir}");
            let Ok(response) = ureq::get(&subdir_url).call() else {
                continue;
            };
            let Ok(body) = response.into_string() else {
                continue;
            };
            for href in extract_hrefs(&body) {
                if let Some(arch) = href
                    .strip_prefix("Contents-")
                    .and_then(|rest| rest.strip_suffix(".gz"))
                {
                    configs.push(PackagingConfig::new("ubuntu", subdir_name.clone(), arch));
                }
            }
        }
        Ok(configs)
    }

    fn dockerfile(&self) -> String {
        format!(
            r#"FROM {os}:{version} AS builder

ENV DEBIAN_FRONTEND=noninteractive
RUN apt-get -y update && apt-get install -y strace

FROM {os}:{version}
ENV DEBIAN_FRONTEND=noninteractive
RUN apt-get -y update
RUN echo "APT::Get::Install-Recommends \"false\";" >> /etc/apt/apt.conf
RUN echo "APT::Get::Install-Suggests \"false\";" >> /etc/apt/apt.conf
RUN mkdir /src/
COPY --from=builder /usr/bin/strace /usr/bin/strace-native
COPY deptective-strace /usr/bin/deptective-strace
COPY deptective-files-exist /usr/bin/deptective-files-exist

ENTRYPOINT ["/usr/bin/deptective-strace"]
"#,
            os = self.config.os,
            version = self.config.os_version,
        )
    }
}

fn parse_contents_line(line: &str) -> Result<ContentIndexEntry, anyhow::Error> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let filename = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("unexpected line: {line:?}"))?;
    let packages_field = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("unexpected line: {line:?}"))?
        .trim();
    let packages = packages_field
        .split(',')
        .map(|pkg| pkg.rsplit('/').next().unwrap_or(pkg).trim().to_string())
        .collect();
    Ok(ContentIndexEntry {
        filename: filename.to_string(),
        packages,
    })
}

/// Extracts `href="..."` targets from a directory-listing HTML page, skipping absolute
/// links (parent-directory navigation) just as the original distribution crawler did.
fn extract_hrefs(html: &str) -> Vec<String> {
    let mut hrefs = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find("href=\"") {
        rest = &rest[start + "href=\"".len()..];
        let Some(end) = rest.find('"') else { break };
        let href = &rest[..end];
        if !href.starts_with('/') {
            hrefs.push(href.to_string());
        }
        rest = &rest[end + 1..];
    }
    hrefs
}

struct ProgressRead<R> {
    inner: R,
    bar: ProgressBar,
}

impl<R: Read> Read for ProgressRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bar.inc(n as u64);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_contents_line_into_package_set() {
        let entry = parse_contents_line("usr/bin/gcc-12   devel/gcc-12,utils/gcc-12-multilib").unwrap();
        assert_eq!(entry.filename, "usr/bin/gcc-12");
        assert_eq!(entry.packages, vec!["gcc-12".to_string(), "gcc-12-multilib".to_string()]);
    }

    #[test]
    fn extract_hrefs_skips_absolute_links() {
        let html = r#"<a href="noble/">noble</a> <a href="/ubuntu/">up</a>"#;
        assert_eq!(extract_hrefs(html), vec!["noble/".to_string()]);
    }

    #[test]
    fn dockerfile_embeds_os_and_version() {
        let apt = Apt::new(PackagingConfig::new("ubuntu", "noble", "amd64"));
        let recipe = apt.dockerfile();
        assert!(recipe.contains("FROM ubuntu:noble AS builder"));
        assert!(recipe.contains("deptective-files-exist"));
    }
}
