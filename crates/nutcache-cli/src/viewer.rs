use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use nutcache_core::{Poller, ReadingCollector, View};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, Paragraph};
use ratatui::Terminal;

const METRIC_KEYS: [(&str, &str, Color); 6] = [
    ("ups_realpower", "Real power (W)", Color::Yellow),
    ("ups_load", "Load (%)", Color::LightYellow),
    ("battery_charge", "Battery charge (%)", Color::Green),
    ("battery_runtime", "Runtime (s)", Color::Magenta),
    ("input_voltage", "Input (V)", Color::Cyan),
    ("output_voltage", "Output (V)", Color::Blue),
];

struct MetricSeries {
    label: &'static str,
    color: Color,
    points: VecDeque<(f64, f64)>,
}

impl MetricSeries {
    fn new(label: &'static str, color: Color) -> Self {
        Self {
            label,
            color,
            points: VecDeque::new(),
        }
    }

    fn push(&mut self, x: f64, y: f64, window_sec: f64) {
        self.points.push_back((x, y));
        while let Some((old_x, _)) = self.points.front() {
            if x - old_x > window_sec {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    fn bounds(&self) -> [f64; 2] {
        if self.points.is_empty() {
            return [0.0, 1.0];
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for (_, y) in &self.points {
            min = min.min(*y);
            max = max.max(*y);
        }
        if (max - min).abs() < f64::EPSILON {
            [min - 1.0, max + 1.0]
        } else {
            let pad = (max - min) * 0.12;
            [min - pad, max + pad]
        }
    }
}

struct ViewerState {
    start: Instant,
    latest: Option<View>,
    ups_count: usize,
    polls: (u64, u64),
    last_error: Option<String>,
    series: Vec<MetricSeries>,
}

impl ViewerState {
    fn new() -> Self {
        let series = METRIC_KEYS
            .iter()
            .map(|(_, label, color)| MetricSeries::new(label, *color))
            .collect();

        Self {
            start: Instant::now(),
            latest: None,
            ups_count: 0,
            polls: (0, 0),
            last_error: None,
            series,
        }
    }

    fn update(&mut self, view: View, ups_count: usize, window_sec: f64) {
        let t = self.start.elapsed().as_secs_f64();
        for (idx, (key, _, _)) in METRIC_KEYS.iter().enumerate() {
            if let Some(value) = view.number(key) {
                self.series[idx].push(t, value, window_sec);
            }
        }
        self.ups_count = ups_count;
        self.latest = Some(view);
    }
}

pub async fn run_viewer<C: ReadingCollector>(poller: &mut Poller<C>, window_sec: f64) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = ViewerState::new();
    let mut next_tick = Instant::now();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                        break;
                    }
                }
            }

            if Instant::now() >= next_tick {
                match poller.tick().await {
                    Ok(outcome) => {
                        state.last_error = None;
                        state.update(outcome.report.view, outcome.devices, window_sec);
                    }
                    Err(err) => state.last_error = Some(err.to_string()),
                }
                state.polls = poller.counters();
                next_tick = Instant::now() + poller.interval();
            }

            terminal.draw(|frame| draw_ui(frame.size(), frame, &state, window_sec))?;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, state: &ViewerState, window_sec: f64) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(0)])
        .split(area);

    frame.render_widget(render_header(state, window_sec), rows[0]);

    let chart_rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
        ])
        .split(rows[1]);

    let now_sec = state.start.elapsed().as_secs_f64();
    let mut series = state.series.iter();
    for row_area in chart_rows.iter().copied() {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(row_area);

        for col in cols.iter().copied() {
            match series.next() {
                Some(metric) => render_metric_chart(frame, col, metric, now_sec, window_sec),
                None => frame.render_widget(Paragraph::new(Line::from(" ")), col),
            }
        }
    }
}

fn render_header(state: &ViewerState, window_sec: f64) -> Paragraph<'static> {
    let mut lines = Vec::new();
    match &state.latest {
        Some(view) => {
            let number = |key: &str| view.number(key).map(|v| format!("{v:.1}")).unwrap_or_else(|| "n/a".into());
            let status = format!(
                "status={} power={}W load={}% charge={}%",
                view.status().unwrap_or("n/a"),
                number("ups_realpower"),
                number("ups_load"),
                number("battery_charge"),
            );
            lines.push(Line::from(vec![
                Span::styled("NUT Rollup Viewer  ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
                Span::raw(status),
            ]));

            let mut devices = format!("devices={}", state.ups_count);
            if state.ups_count > 1 {
                devices.push_str(&format!(
                    " online={} offline={}",
                    number("ups_online_count"),
                    number("ups_offline_count")
                ));
            }
            lines.push(Line::from(format!(
                "{devices}  updated={}  window={}s  (press 'q' to quit)",
                view.timestamp.format("%H:%M:%S"),
                window_sec as u64
            )));
        }
        None => lines.push(Line::from("Waiting for first reading...")),
    }

    let (ok, err) = state.polls;
    let mut poll_line = vec![Span::raw(format!("polls ok={ok} err={err}"))];
    if let Some(error) = &state.last_error {
        poll_line.push(Span::styled(format!("  last error: {error}"), Style::default().fg(Color::Red)));
    }
    lines.push(Line::from(poll_line));

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"))
}

fn render_metric_chart(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    series: &MetricSeries,
    now_sec: f64,
    window_sec: f64,
) {
    let points: Vec<(f64, f64)> = series.points.iter().copied().collect();

    let x_min = (now_sec - window_sec).max(0.0);
    let x_max = now_sec.max(window_sec);
    let y_bounds = series.bounds();

    let dataset = Dataset::default()
        .name(series.label)
        .marker(symbols::Marker::Braille)
        .graph_type(ratatui::widgets::GraphType::Line)
        .style(Style::default().fg(series.color))
        .data(&points);

    let x_mid = (x_min + x_max) / 2.0;

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(series.label))
        .x_axis(
            Axis::default()
                .title("time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([x_min, x_max])
                .labels(vec![
                    Span::raw(format!("{x_min:.0}")),
                    Span::raw(format!("{x_mid:.0}")),
                    Span::raw(format!("{x_max:.0}")),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(y_bounds)
                .labels(vec![
                    Span::raw(format!("{:.1}", y_bounds[0])),
                    Span::raw(format!("{:.1}", (y_bounds[0] + y_bounds[1]) / 2.0)),
                    Span::raw(format!("{:.1}", y_bounds[1])),
                ]),
        );

    frame.render_widget(chart, area);
}
