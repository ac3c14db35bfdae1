//! Object class vocabulary shared by planning, execution and verification.

const PEDESTRIAN_GROUP: [&str; 2] = ["pedestrian", "person"];
const VEHICLE_GROUP: [&str; 5] = ["car", "truck", "bus", "motorcycle", "van"];
const CYCLIST_GROUP: [&str; 2] = ["cyclist", "bicycle"];

/// Lowercase, drop articles, singularize the head noun, fold people/persons into pedestrian.
pub fn normalize_class(phrase: &str) -> String {
    let lower = phrase.trim().to_lowercase();
    let lower = ["the ", "a ", "an ", "any "]
        .iter()
        .find_map(|article| lower.strip_prefix(article))
        .unwrap_or(&lower)
        .trim()
        .to_string();

    let mut words: Vec<String> = lower.split_whitespace().map(str::to_string).collect();
    let Some(head) = words.pop() else {
        return String::new();
    };
    words.push(singularize(&head));
    let class = words.join(" ");

    match class.as_str() {
        "people" | "person" | "pedestrian" | "walker" => "pedestrian".to_string(),
        _ => class,
    }
}

fn singularize(word: &str) -> String {
    match word {
        "people" | "persons" => return "person".to_string(),
        "buses" => return "bus".to_string(),
        "pedestrians" => return "pedestrian".to_string(),
        _ => {}
    }
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{}y", stem);
    }
    for suffix in ["ches", "shes", "xes", "sses"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.ends_with(['s', 'u']) && !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

/// True when a detected `node_class` satisfies the queried `wanted` class.
pub fn class_matches(node_class: &str, wanted: &str) -> bool {
    let node_class = normalize_class(node_class);
    let wanted = normalize_class(wanted);
    if wanted.is_empty() {
        return false;
    }
    if node_class == wanted {
        return true;
    }
    if wanted == "vehicle" {
        return VEHICLE_GROUP.contains(&node_class.as_str());
    }
    [&PEDESTRIAN_GROUP[..], &CYCLIST_GROUP[..]]
        .iter()
        .any(|group| group.contains(&node_class.as_str()) && group.contains(&wanted.as_str()))
}

/// Whether `text` (lowercase) mentions `class` in singular, plural or a synonym.
pub fn mentions_class(text: &str, class: &str) -> bool {
    let class = normalize_class(class);
    if class.is_empty() {
        return false;
    }
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != ' ')
        .flat_map(|s| s.split_whitespace())
        .map(str::to_string)
        .collect();

    let class_len = class.split_whitespace().count();
    words.windows(class_len.max(1)).any(|window| {
        let candidate = normalize_class(&window.join(" "));
        class_matches(&class, &candidate)
    })
}
