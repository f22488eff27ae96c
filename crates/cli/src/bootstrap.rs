//! Shell commands run on cluster nodes during first boot.
//!
//! Each builder returns a single line of `;`-separated statements so one ssh
//! session runs the whole step.

/// Yum repository definition for the management service.
pub const AUX_REPO_URL: &str = "http://public-repo-1.hortonworks.com/ambari/centos6/1.x/updates/1.6.0/ambari.repo";

/// Starts the management service on the auxiliary node and reports its status.
pub const AUX_START: &str = "ambari-server start; ambari-server status;";

/// Where the operator's private key lands on the control-plane and auxiliary nodes.
pub const REMOTE_KEY_PATH: &str = "~/.ssh/id_rsa";

/// Instance-store volume as the guest kernel names it.
const EPHEMERAL_BLOCK: &str = "/dev/xvdz";
const EBS_BLOCK: &str = "/dev/xvdv";

fn join(statements: &[String]) -> String {
    statements.join("; ")
}

/// Allow root logins over ssh. Runs as `login_user`, so everything is sudo'd.
pub fn enable_root(login_user: &str) -> String {
    join(&[
        r#"echo "PermitRootLogin yes" | sudo tee -a /etc/ssh/sshd_config"#.into(),
        r#"echo "JAVA_HOME=/usr/local" | sudo tee -a /root/.bash_profile"#.into(),
        format!("sudo cp /home/{}/.ssh/authorized_keys /root/.ssh/authorized_keys", login_user),
        "sudo /etc/init.d/sshd restart".into(),
    ])
}

/// Base packages, SELinux and firewall off, then reboot.
///
/// The reboot is detached so the ssh session exits cleanly before the node
/// goes down.
pub fn configure_node() -> String {
    join(&[
        "yum -y install screen".into(),
        "yum -y install git".into(),
        "sed -i -e 's/^SELINUX=.*$/SELINUX=disabled/' /etc/selinux/config".into(),
        "chkconfig iptables off".into(),
        "chkconfig ip6tables off".into(),
        "nohup sh -c 'sleep 2 && shutdown -r now' >/dev/null 2>&1 &".into(),
    ])
}

/// Format and mount local storage, add swap, restart time sync.
pub fn start_services(swap_mb: u32, ebs: bool) -> String {
    let mut statements = vec![
        format!("mkfs.ext4 -q {}", EPHEMERAL_BLOCK),
        "mkdir -p /hadoop".to_string(),
        format!("mount {} /hadoop", EPHEMERAL_BLOCK),
    ];
    if ebs {
        statements.push(format!("mkfs.ext4 -q {}", EBS_BLOCK));
        statements.push("mkdir -p /vol".into());
        statements.push(format!("mount {} /vol", EBS_BLOCK));
    }
    if swap_mb > 0 {
        statements.push(format!("dd if=/dev/zero of=/mnt/swap bs=1M count={}", swap_mb));
        statements.push("mkswap /mnt/swap".into());
        statements.push("swapon /mnt/swap".into());
    }
    statements.push("/etc/init.d/ntpd restart".into());
    join(&statements)
}

pub fn prepare_key_dir() -> String {
    "mkdir -p ~/.ssh".into()
}

pub fn lock_key() -> String {
    format!("chmod 600 {}", REMOTE_KEY_PATH)
}

/// Install, set up with default answers, and start the management service.
pub fn setup_auxiliary() -> String {
    join(&[
        format!("wget -q -N {}", AUX_REPO_URL),
        "cp ambari.repo /etc/yum.repos.d".into(),
        "yum -y install epel-release".into(),
        "yum -y repolist".into(),
        "yum -y install ambari-server".into(),
        r#"yes "" | ambari-server setup"#.into(),
        "ambari-server start".into(),
        "ambari-server status".into(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_single_lines() {
        for cmd in [enable_root("ec2-user"), configure_node(), start_services(1024, true), setup_auxiliary()] {
            assert!(!cmd.contains('\n'), "{cmd}");
            assert!(!cmd.contains("&;"), "{cmd}");
        }
    }

    #[test]
    fn enable_root_copies_the_login_users_keys() {
        assert!(enable_root("centos").contains("/home/centos/.ssh/authorized_keys /root/.ssh/authorized_keys"));
    }

    #[test]
    fn start_services_mounts_only_what_exists() {
        let plain = start_services(0, false);
        assert!(plain.contains("mount /dev/xvdz /hadoop"));
        assert!(!plain.contains("/vol"));
        assert!(!plain.contains("swapon"));

        let full = start_services(2048, true);
        assert!(full.contains("mount /dev/xvdv /vol"));
        assert!(full.contains("count=2048"));
        assert!(full.ends_with("/etc/init.d/ntpd restart"));
    }

    #[test]
    fn reboot_is_detached() {
        assert!(configure_node().ends_with("shutdown -r now' >/dev/null 2>&1 &"));
    }
}
