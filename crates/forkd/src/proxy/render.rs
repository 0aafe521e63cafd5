//! nginx configuration rendering.
//!
//! Rendering is a pure function of the session list and the domain suffix.
//! Upstreams are written as variables so nginx resolves container names at
//! request time through the runtime's embedded DNS instead of once at load.

use fork_core::{hostname, sanitize_dns_label, upstream_host, Session, SessionId};

/// Path answered with 200 by the default server.
pub const HEALTH_PATH: &str = "/__fork/health";

/// Embedded DNS server of user-defined container networks.
pub const DNS_RESOLVER: &str = "127.0.0.11";

/// One routable entry: a hostname mapped to an upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub session_id: SessionId,
    pub service: String,
    pub server_name: String,
    /// `host:port`
    pub upstream: String,
}

/// Computes the virtual hosts for a session list.
///
/// Each service of each session yields exactly one host; sessions without
/// services yield none.
pub fn virtual_hosts(sessions: &[Session], domain: &str) -> Vec<VirtualHost> {
    sessions
        .iter()
        .flat_map(|session| {
            let upstream = upstream_host(&session.project, &session.id);
            session.services.iter().map(move |service| VirtualHost {
                session_id: session.id.clone(),
                service: service.name.clone(),
                server_name: hostname(service, &session.project, &session.id, domain),
                upstream: format!("{}:{}", upstream, service.port),
            })
        })
        .collect()
}

/// Renders the complete proxy configuration.
pub fn render(sessions: &[Session], domain: &str) -> String {
    let hosts = virtual_hosts(sessions, domain);

    let mut out = String::with_capacity(1024 + hosts.len() * 640);
    out.push_str("# Generated by forkd. Manual edits are overwritten.\n");
    out.push_str(&format!("# virtual hosts: {}\n\n", hosts.len()));
    out.push_str(&format!("resolver {DNS_RESOLVER} valid=10s ipv6=off;\n\n"));
    out.push_str(PREAMBLE);

    for host in &hosts {
        out.push('\n');
        out.push_str(&render_host(host));
    }

    out
}

const PREAMBLE: &str = r#"map $http_upgrade $connection_upgrade {
    default upgrade;
    ''      close;
}

server {
    listen 80 default_server;
    server_name _;

    location = /__fork/health {
        access_log off;
        default_type text/plain;
        return 200 "ok\n";
    }

    location / {
        return 404;
    }
}
"#;

/// Every interpolated value is either sanitized here or already a DNS
/// label built by `fork_core::naming`, so no session can break out of its
/// own `server` block.
fn render_host(host: &VirtualHost) -> String {
    format!(
        r#"# session {session} service {service}
server {{
    listen 80;
    server_name {server_name};

    location / {{
        set $upstream {upstream};
        proxy_pass http://$upstream;
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection $connection_upgrade;
    }}
}}
"#,
        session = sanitize_dns_label(host.session_id.as_str()),
        service = sanitize_dns_label(&host.service),
        server_name = host.server_name,
        upstream = host.upstream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fork_core::Service;

    fn demo_session() -> Session {
        Session::new("abc", "demo")
            .with_services(vec![Service::new("web", 3000).with_subdomain("web")])
    }

    #[test]
    fn test_single_service_host() {
        let config = render(&[demo_session()], "localhost");

        assert!(config.contains("server_name web.demo-abc.localhost;"));
        assert!(config.contains("set $upstream demo-abc:3000;"));
        assert!(config.contains("proxy_pass http://$upstream;"));
        assert!(config.contains("resolver 127.0.0.11"));
    }

    #[test]
    fn test_zero_services_yield_no_hosts() {
        let empty = Session::new("idle", "demo");
        assert!(virtual_hosts(&[empty.clone()], "localhost").is_empty());

        let config = render(&[empty], "localhost");
        assert_eq!(config.matches("server_name").count(), 1);
        assert!(config.contains("default_server"));
        assert!(config.contains(HEALTH_PATH));
    }

    #[test]
    fn test_n_services_yield_n_hosts() {
        let session = Session::new("abc", "demo").with_services(vec![
            Service::new("web", 3000),
            Service::new("api", 8000).with_subdomain("backend"),
            Service::new("docs", 4000),
        ]);
        let hosts = virtual_hosts(&[session.clone()], "dev.test");
        let names: Vec<_> = hosts.iter().map(|h| h.server_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "web.demo-abc.dev.test",
                "backend.demo-abc.dev.test",
                "docs.demo-abc.dev.test",
            ]
        );

        let config = render(&[session], "dev.test");
        assert_eq!(config.matches("listen 80;").count(), 3);
    }

    #[test]
    fn test_hostile_names_stay_inside_their_block() {
        // Bypasses validation, as a session built in memory would.
        let mut session = Session::new("abc\n}\nserver {", "demo");
        session.services = vec![Service::new(
            "web\n}\nserver { listen 80; return 500; }\n#",
            3000,
        )];

        let config = render(&[session], "localhost");

        assert!(!config.contains("return 500"));
        assert_eq!(config.matches("server {").count(), 2);
        assert!(config.contains(
            "# session abc---server service web---server---listen-80--return-500\n"
        ));
        assert!(config.contains(
            "server_name web---server---listen-80--return-500.demo-abc---server.localhost;"
        ));
    }

    #[test]
    fn test_render_is_deterministic() {
        let sessions = vec![demo_session(), Session::new("b", "demo")];
        assert_eq!(render(&sessions, "localhost"), render(&sessions, "localhost"));
    }
}
