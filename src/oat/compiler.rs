use std::{
    fs::File,
    os::{fd::AsRawFd, unix::process::CommandExt},
    path::PathBuf,
    process::Command,
};

/// Produces a compiled artifact for a dex file, writing it to `oat_file`.
pub trait OatCompiler: Send + Sync {
    fn generate_oat_file(
        &self,
        dex_filename: &str,
        oat_file: &File,
        oat_location: &str,
    ) -> Result<(), String>;
}

/// Runs the external `dex2oat` compiler in a child process. The artifact
/// descriptor is inherited by the child, which writes through it.
pub struct Dex2OatCompiler {
    executable: PathBuf,
    class_path: String,
    boot_image: Option<String>,
    host: bool,
    verification_enabled: bool,
    options: Vec<String>,
}

impl Dex2OatCompiler {
    pub fn new(executable: PathBuf, class_path: &str) -> Self {
        return Dex2OatCompiler {
            executable,
            class_path: class_path.to_string(),
            boot_image: None,
            host: !cfg!(target_os = "android"),
            verification_enabled: true,
            options: vec![],
        };
    }

    pub fn with_boot_image(mut self, boot_image: &str) -> Self {
        self.boot_image = Some(boot_image.to_string());
        self
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verification_enabled = enabled;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn command_line(&self, dex_filename: &str, oat_fd: i32, oat_location: &str) -> Vec<String> {
        let mut argv = vec![self.executable.display().to_string()];
        for runtime_arg in ["-Xms64m", "-Xmx64m", "-classpath", self.class_path.as_str()] {
            argv.push("--runtime-arg".to_string());
            argv.push(runtime_arg.to_string());
        }
        if !self.verification_enabled {
            argv.push("--compiler-filter=verify-none".to_string());
        }
        if self.host {
            argv.push("--host".to_string());
        }
        if let Some(boot_image) = &self.boot_image {
            argv.push(format!("--boot-image={}", boot_image));
        }
        argv.push(format!("--dex-file={}", dex_filename));
        argv.push(format!("--oat-fd={}", oat_fd));
        argv.push(format!("--oat-location={}", oat_location));
        argv.extend(self.options.iter().cloned());
        return argv;
    }
}

impl OatCompiler for Dex2OatCompiler {
    fn generate_oat_file(
        &self,
        dex_filename: &str,
        oat_file: &File,
        oat_location: &str,
    ) -> Result<(), String> {
        let oat_fd = oat_file.as_raw_fd();
        let argv = self.command_line(dex_filename, oat_fd, oat_location);
        log::info!("GenerateOatFile: {}", argv.join(" "));
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(oat_fd, libc::F_SETFD, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let status = command
            .status()
            .map_err(|e| format!("Failed to execute {}: {}", argv[0], e))?;
        if !status.success() {
            return Err(format!("Failed {}: {}", argv.join(" "), status));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Dex2OatCompiler, OatCompiler};

    #[test]
    fn command_line_layout() {
        let compiler = Dex2OatCompiler::new(PathBuf::from("/system/bin/dex2oat"), "/data/app/a.jar")
            .with_boot_image("/system/framework/boot.art")
            .with_verification(false)
            .with_options(vec!["-j2".to_string()]);
        let argv = compiler.command_line("/data/app/a.jar", 7, "/data/dalvik-cache/data@app@a.jar@classes.dex");
        assert_eq!(argv[0], "/system/bin/dex2oat");
        assert_eq!(&argv[1..5], &["--runtime-arg", "-Xms64m", "--runtime-arg", "-Xmx64m"]);
        assert_eq!(&argv[5..9], &["--runtime-arg", "-classpath", "--runtime-arg", "/data/app/a.jar"]);
        assert!(argv.contains(&"--compiler-filter=verify-none".to_string()));
        assert!(argv.contains(&"--boot-image=/system/framework/boot.art".to_string()));
        assert!(argv.contains(&"--dex-file=/data/app/a.jar".to_string()));
        assert!(argv.contains(&"--oat-fd=7".to_string()));
        assert_eq!(argv.last().unwrap(), "-j2");
    }

    #[test]
    fn missing_executable_fails() {
        let compiler = Dex2OatCompiler::new(PathBuf::from("/nonexistent/dex2oat"), "");
        let file = tempfile::tempfile().unwrap();
        assert!(compiler.generate_oat_file("/data/app/a.jar", &file, "a.oat").is_err());
    }
}
