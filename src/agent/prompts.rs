/// Centralized prompts for the detector VLM, the planner LLM and the answer summarizer.
/// All prompts ask for short, line-oriented or JSON outputs that are cheap to parse.

/// Prompt for the vision model acting as an object detector.
pub fn detection_prompt(width: u32, height: u32) -> String {
    format!(
        r#"List every traffic participant and traffic element in this driving image.
The image is {} x {} pixels. One object per line, nothing else.
FORMAT: class | confidence | x1, y1, x2, y2

Example:
car | 0.92 | 412, 230, 598, 344
pedestrian | 0.81 | 120, 200, 160, 330
traffic light | 0.60 | 700, 40, 720, 95

Objects:
"#,
        width, height
    )
}

/// Prompt for VLM scene context and per-object descriptors.
pub fn perception_context_prompt(detection_lines: &str, question: &str) -> String {
    let focus = if question.trim().is_empty() {
        String::new()
    } else {
        format!("\nFocus on: {}\n", question.trim())
    };

    format!(
        r#"You are analyzing a driving scene. The detector found these objects:
{}

For each object you can see, write one line:
obj_N: color=COLOR, state=moving|stopped|parked

Then write one line starting with SCENE: describing road conditions,
movement patterns and any safety concerns.
{}
Answer:"#,
        detection_lines, focus
    )
}

/// Prompt for LLM planning when no rule matches the question.
pub fn planning_prompt(question: &str, scene_summary: &str) -> String {
    format!(
        r#"Plan how to answer a driving question using ONLY these step kinds:
- count_objects: {{"class": "car"}}
- check_spatial: {{"relation": "left_of", "source": 0, "target": 1, "class": null}}
- get_attribute: {{"node": 0, "key": "color"}}
- check_safety: {{"classes": ["pedestrian"], "max_distance": 10.0}}
- predict_behavior: {{"node": 0}}
- answer_direct: {{"reason": "..."}}

Relations: left_of, right_of, in_front_of, behind, near, far.
Node ids refer to obj_N in the scene.

Scene: {}

Example:
Question: Is the car obj_1 to the left of obj_0?
Plan: [{{"kind": "check_spatial", "parameters": {{"relation": "left_of", "source": 1, "target": 0}}, "rationale": "Compare positions"}}]

Question: {}
Plan:"#,
        scene_summary, question
    )
}

/// Prompt for phrasing the final answer from the executed evidence.
pub fn answer_summary_prompt(question: &str, evidence: &str, draft: &str) -> String {
    format!(
        r#"Answer the driving question from the evidence. Be concise and accurate.
Do not add facts that are not in the evidence.

Question: {}

Evidence:
{}

Draft answer: {}

Final answer:"#,
        question, evidence, draft
    )
}
