//! Display-server and desktop detection, run once at startup.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayServer {
    X11,
    Wayland,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Desktop {
    Gnome,
    Kde,
    Xfce,
    Cinnamon,
    Mate,
    Hyprland,
    Sway,
    Other(String),
    Unknown,
}

/// How synthetic paste keystrokes reach the focused window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// The display server accepts synthetic events from clients (XTest).
    DirectInjection,
    /// Input is isolated; keystrokes go through a kernel uinput device.
    VirtualDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub display_server: DisplayServer,
    pub desktop: Desktop,
    pub injection: InjectionMode,
}

impl Session {
    pub fn probe() -> Self {
        Self::probe_with(|key| std::env::var(key).ok())
    }

    /// Probe against an arbitrary variable lookup.
    pub fn probe_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let display_server = match var("XDG_SESSION_TYPE").map(|s| s.to_lowercase()).as_deref() {
            Some("wayland") => DisplayServer::Wayland,
            Some("x11") => DisplayServer::X11,
            _ if var("WAYLAND_DISPLAY").is_some() => DisplayServer::Wayland,
            _ if var("DISPLAY").is_some() => DisplayServer::X11,
            _ => DisplayServer::Unknown,
        };

        let desktop = var("XDG_CURRENT_DESKTOP")
            .or_else(|| var("DESKTOP_SESSION"))
            .map(|raw| classify_desktop(&raw))
            .unwrap_or(Desktop::Unknown);

        let injection = match display_server {
            DisplayServer::Wayland => InjectionMode::VirtualDevice,
            DisplayServer::X11 | DisplayServer::Unknown => InjectionMode::DirectInjection,
        };

        Self {
            display_server,
            desktop,
            injection,
        }
    }

    /// Whether any display server is reachable at all.
    pub fn has_display() -> bool {
        std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some()
    }
}

fn classify_desktop(raw: &str) -> Desktop {
    for part in raw.split(':').map(|p| p.trim().to_lowercase()) {
        let desktop = match part.as_str() {
            "gnome" | "ubuntu" | "unity" | "gnome-classic" | "pop" => Desktop::Gnome,
            "kde" | "plasma" | "plasmawayland" => Desktop::Kde,
            "xfce" | "xfce4" => Desktop::Xfce,
            "x-cinnamon" | "cinnamon" => Desktop::Cinnamon,
            "mate" => Desktop::Mate,
            "hyprland" => Desktop::Hyprland,
            "sway" => Desktop::Sway,
            _ => continue,
        };
        return desktop;
    }
    Desktop::Other(raw.to_string())
}

impl fmt::Display for DisplayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisplayServer::X11 => "x11",
            DisplayServer::Wayland => "wayland",
            DisplayServer::Unknown => "unknown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn probe(vars: &[(&str, &str)]) -> Session {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Session::probe_with(|key| vars.get(key).cloned())
    }

    #[test]
    fn session_type_wins_over_display_vars() {
        let s = probe(&[("XDG_SESSION_TYPE", "wayland"), ("DISPLAY", ":0")]);
        assert_eq!(s.display_server, DisplayServer::Wayland);
        assert_eq!(s.injection, InjectionMode::VirtualDevice);
    }

    #[test]
    fn falls_back_to_display_vars() {
        let s = probe(&[("XDG_SESSION_TYPE", "tty"), ("DISPLAY", ":1")]);
        assert_eq!(s.display_server, DisplayServer::X11);
        assert_eq!(s.injection, InjectionMode::DirectInjection);

        let s = probe(&[("WAYLAND_DISPLAY", "wayland-0")]);
        assert_eq!(s.display_server, DisplayServer::Wayland);
    }

    #[test]
    fn unknown_server_uses_direct_injection() {
        let s = probe(&[]);
        assert_eq!(s.display_server, DisplayServer::Unknown);
        assert_eq!(s.desktop, Desktop::Unknown);
        assert_eq!(s.injection, InjectionMode::DirectInjection);
    }

    #[test]
    fn classifies_desktop_lists() {
        assert_eq!(probe(&[("XDG_CURRENT_DESKTOP", "ubuntu:GNOME")]).desktop, Desktop::Gnome);
        assert_eq!(probe(&[("XDG_CURRENT_DESKTOP", "KDE")]).desktop, Desktop::Kde);
        assert_eq!(probe(&[("DESKTOP_SESSION", "xfce")]).desktop, Desktop::Xfce);
        assert_eq!(
            probe(&[("XDG_CURRENT_DESKTOP", "LXQt")]).desktop,
            Desktop::Other("LXQt".to_string())
        );
    }

    #[test]
    fn probe_output_is_stable_json() {
        let s = probe(&[("XDG_SESSION_TYPE", "x11"), ("XDG_CURRENT_DESKTOP", "X-Cinnamon")]);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["display_server"], "x11");
        assert_eq!(json["desktop"], "cinnamon");
        assert_eq!(json["injection"], "direct_injection");
    }
}
