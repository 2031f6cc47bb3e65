use super::{colorize_status, json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use elbe_core::selections::detect_host_arch;
use elbe_runtime::HostSystem;
use elbe_schema::SandboxSection;

pub fn run(json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);
    check_host_arch(&mut checks);
    check_sandbox_sources(&mut checks);

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = elbe_runtime::check_build_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass("build_prereqs", "Build prerequisites satisfied"));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "build_prereqs",
            &elbe_runtime::format_missing(&missing),
        ));
    }
}

fn check_host_arch(checks: &mut Vec<Check>) {
    match detect_host_arch(&HostSystem::new()) {
        Ok(arch) => checks.push(Check::info(
            "host_arch",
            &format!("Host architecture: {arch} (other targets need an interpreter)"),
        )),
        Err(e) => checks.push(Check::warn(
            "host_arch",
            &format!("Cannot detect host architecture: {e}"),
        )),
    }
}

fn check_sandbox_sources(checks: &mut Vec<Check>) {
    let defaults = SandboxSection::default();
    if defaults.interpreter_dir.is_dir() {
        checks.push(Check::pass(
            "interpreter_dir",
            &format!("Interpreter directory {} exists", defaults.interpreter_dir.display()),
        ));
    } else {
        checks.push(Check::info(
            "interpreter_dir",
            &format!(
                "No {}, interpreters are looked up in /usr/bin",
                defaults.interpreter_dir.display()
            ),
        ));
    }
    for (name, path) in [
        ("resolv_conf", &defaults.resolv_conf),
        ("apt_conf", &defaults.apt_conf),
    ] {
        if path.exists() {
            checks.push(Check::pass(
                name,
                &format!("{} is injected into sandboxes", path.display()),
            ));
        } else {
            checks.push(Check::info(
                name,
                &format!("{} missing, targets keep their own", path.display()),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("elbe-build doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} [{}] {}", colorize_status(check.status), check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
